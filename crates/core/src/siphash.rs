//! SipHash-2-4 keyed hashing for `Hash` containers, seeded from the
//! interpreter config's 16-byte `sipkey` (spec §3, §4.9). Keys must be
//! `String`, `Integer`, or `ByteString`; this module only implements the
//! hash function itself, not the container (see `lily-runtime::hash`).

const ROUNDS_C: u32 = 2;
const ROUNDS_D: u32 = 4;

/// A `std::hash::Hasher` implementing SipHash-2-4, keyed per-state rather
/// than process-global the way `std::collections::HashMap`'s default
/// hasher is — every `State` gets its own key from `Config::sipkey` so two
/// interpreter instances never agree on hash bucket placement.
pub struct SipHasher24 {
    v0: u64,
    v1: u64,
    v2: u64,
    v3: u64,
    tail: u64,
    tail_len: u8,
    len: u64,
}

impl SipHasher24 {
    pub fn new_with_key(key: &[u8; 16]) -> Self {
        let k0 = u64::from_le_bytes(key[0..8].try_into().unwrap());
        let k1 = u64::from_le_bytes(key[8..16].try_into().unwrap());
        SipHasher24 {
            v0: k0 ^ 0x736f6d6570736575,
            v1: k1 ^ 0x646f72616e646f6d,
            v2: k0 ^ 0x6c7967656e657261,
            v3: k1 ^ 0x7465646279746573,
            tail: 0,
            tail_len: 0,
            len: 0,
        }
    }

    fn sipround(&mut self) {
        self.v0 = self.v0.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(13);
        self.v1 ^= self.v0;
        self.v0 = self.v0.rotate_left(32);
        self.v2 = self.v2.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(16);
        self.v3 ^= self.v2;
        self.v0 = self.v0.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(21);
        self.v3 ^= self.v0;
        self.v2 = self.v2.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(17);
        self.v1 ^= self.v2;
        self.v2 = self.v2.rotate_left(32);
    }

    fn process_block(&mut self, m: u64) {
        self.v3 ^= m;
        for _ in 0..ROUNDS_C {
            self.sipround();
        }
        self.v0 ^= m;
    }
}

impl std::hash::Hasher for SipHasher24 {
    fn write(&mut self, mut bytes: &[u8]) {
        self.len = self.len.wrapping_add(bytes.len() as u64);

        if self.tail_len > 0 {
            let need = (8 - self.tail_len as usize).min(bytes.len());
            for i in 0..need {
                self.tail |= (bytes[i] as u64) << (8 * self.tail_len as usize);
                self.tail_len += 1;
            }
            bytes = &bytes[need..];
            if self.tail_len == 8 {
                let m = self.tail;
                self.process_block(m);
                self.tail = 0;
                self.tail_len = 0;
            }
        }

        while bytes.len() >= 8 {
            let m = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
            self.process_block(m);
            bytes = &bytes[8..];
        }

        for &b in bytes {
            self.tail |= (b as u64) << (8 * self.tail_len as usize);
            self.tail_len += 1;
        }
    }

    fn finish(&self) -> u64 {
        let mut v0 = self.v0;
        let mut v1 = self.v1;
        let mut v2 = self.v2;
        let mut v3 = self.v3;

        let b = (self.len << 56) | self.tail;

        v3 ^= b;
        let mut round = |v0: &mut u64, v1: &mut u64, v2: &mut u64, v3: &mut u64| {
            *v0 = v0.wrapping_add(*v1);
            *v1 = v1.rotate_left(13);
            *v1 ^= *v0;
            *v0 = v0.rotate_left(32);
            *v2 = v2.wrapping_add(*v3);
            *v3 = v3.rotate_left(16);
            *v3 ^= *v2;
            *v0 = v0.wrapping_add(*v3);
            *v3 = v3.rotate_left(21);
            *v3 ^= *v0;
            *v2 = v2.wrapping_add(*v1);
            *v1 = v1.rotate_left(17);
            *v1 ^= *v2;
            *v2 = v2.rotate_left(32);
        };
        for _ in 0..ROUNDS_C {
            round(&mut v0, &mut v1, &mut v2, &mut v3);
        }
        v0 ^= b;

        v2 ^= 0xff;
        for _ in 0..ROUNDS_D {
            round(&mut v0, &mut v1, &mut v2, &mut v3);
        }

        v0 ^ v1 ^ v2 ^ v3
    }
}

/// Hashable key kinds for `Hash` containers. Content equality, not
/// identity, so two distinct `String` heap objects holding `"a"` collide
/// and compare equal as keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SipKey {
    Integer(i64),
    String(String),
    ByteString(Vec<u8>),
}

pub fn hash_key(key: &SipKey, sipkey: &[u8; 16]) -> u64 {
    use std::hash::Hasher;
    let mut hasher = SipHasher24::new_with_key(sipkey);
    match key {
        SipKey::Integer(i) => hasher.write(&i.to_le_bytes()),
        SipKey::String(s) => hasher.write(s.as_bytes()),
        SipKey::ByteString(b) => hasher.write(b),
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_same_sipkey_hashes_equal() {
        let k = [0u8; 16];
        let a = hash_key(&SipKey::String("abc".into()), &k);
        let b = hash_key(&SipKey::String("abc".into()), &k);
        assert_eq!(a, b);
    }

    #[test]
    fn different_sipkey_changes_hash() {
        let a = hash_key(&SipKey::String("abc".into()), &[0u8; 16]);
        let mut k2 = [0u8; 16];
        k2[0] = 1;
        let b = hash_key(&SipKey::String("abc".into()), &k2);
        assert_ne!(a, b);
    }

    #[test]
    fn integer_and_string_keys_differ() {
        let k = [7u8; 16];
        let a = hash_key(&SipKey::Integer(65), &k);
        let b = hash_key(&SipKey::String("A".into()), &k);
        assert_ne!(a, b);
    }
}
