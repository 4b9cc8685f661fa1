//! Growable owned buffer used for error messages and `String.format`-style
//! interpolation. Every `State` owns one; callers must copy out before the
//! next flush (spec §9's "scoped borrow" guidance is enforced by `flush`
//! taking `&mut self` and returning an owned `String`, so the borrow
//! checker rejects holding a reference across the next call).

#[derive(Debug, Default)]
pub struct MsgBuf {
    message: String,
    truncated: bool,
}

impl MsgBuf {
    pub fn new() -> Self {
        MsgBuf {
            message: String::with_capacity(64),
            truncated: false,
        }
    }

    pub fn add(&mut self, s: &str) -> &mut Self {
        if !self.truncated {
            self.message.push_str(s);
        }
        self
    }

    pub fn add_char(&mut self, c: char) -> &mut Self {
        if !self.truncated {
            self.message.push(c);
        }
        self
    }

    /// Appends `text[start..stop]`. Mirrors the original's
    /// `add_text_range`, used when copying a sub-slice of a string literal.
    pub fn add_slice(&mut self, text: &str, start: usize, stop: usize) -> &mut Self {
        if !self.truncated {
            self.message.push_str(&text[start..stop]);
        }
        self
    }

    pub fn add_fmt(&mut self, args: fmt::Arguments<'_>) -> &mut Self {
        if !self.truncated {
            let _ = fmt::Write::write_fmt(&mut self.message, args);
        }
        self
    }

    /// Recursively renders a value for tracebacks and interpolation. Depth
    /// is bounded the same way equality is (spec §4.1): past 100 nested
    /// containers this stops descending rather than looping forever.
    pub fn add_value(&mut self, depth: u32, render: impl FnOnce(&mut MsgBuf, u32)) {
        if depth >= 100 {
            self.add("...");
            return;
        }
        render(self, depth);
    }

    pub fn html_escape(&mut self, s: &str) -> &mut Self {
        if self.truncated {
            return self;
        }
        for c in s.chars() {
            match c {
                '&' => self.message.push_str("&amp;"),
                '<' => self.message.push_str("&lt;"),
                '>' => self.message.push_str("&gt;"),
                '"' => self.message.push_str("&quot;"),
                _ => self.message.push(c),
            }
        }
        self
    }

    /// Resets the buffer and returns its previous contents. The "flush then
    /// format" idiom (`sprintf`) is just `reset` followed by `add_fmt`.
    pub fn flush(&mut self) -> String {
        self.truncated = false;
        std::mem::take(&mut self.message)
    }

    pub fn sprintf(&mut self, args: fmt::Arguments<'_>) -> String {
        self.flush();
        self.add_fmt(args);
        self.flush()
    }

    pub fn reset(&mut self) {
        self.message.clear();
        self.truncated = false;
    }

    pub fn as_str(&self) -> &str {
        &self.message
    }

    pub fn mark_truncated(&mut self) {
        self.truncated = true;
    }
}

use std::fmt;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_flush_round_trips() {
        let mut buf = MsgBuf::new();
        buf.add("hello ").add("world");
        assert_eq!(buf.flush(), "hello world");
        assert_eq!(buf.as_str(), "");
    }

    #[test]
    fn html_escape_covers_the_five_entities() {
        let mut buf = MsgBuf::new();
        buf.html_escape("<a href=\"x\">&</a>");
        assert_eq!(buf.flush(), "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;");
    }

    #[test]
    fn add_slice_copies_the_requested_range() {
        let mut buf = MsgBuf::new();
        buf.add_slice("hello world", 6, 11);
        assert_eq!(buf.flush(), "world");
    }

    #[test]
    fn truncated_buffer_ignores_further_adds() {
        let mut buf = MsgBuf::new();
        buf.add("a");
        buf.mark_truncated();
        buf.add("b");
        assert_eq!(buf.flush(), "a");
    }
}
