//! The opcode set (spec §6 "Bytecode") and positional operand decoding.
//!
//! Emission is out of scope — nothing in this crate ever produces a
//! `Bytecode` buffer except the placeholder assembler in `crates/cli` — but
//! the interpreter still needs a concrete, exhaustive opcode list and a
//! stable operand layout to dispatch on. Each instruction is a line number
//! word followed by an opcode word followed by its operands, all `u16`,
//! matching spec §6's "preceded by a line number... operand order must be
//! preserved because the interpreter uses positional decoding."

use lily_core::heap::Bytecode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Modulo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitwiseOp {
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// R(dest) := R(src) (deref/incref protocol, spec §4.1 `assign`)
    Assign { dest: u16, src: u16 },
    /// Like `Assign` but `src` is itself a reference that must be
    /// re-derefed first (spec's `ref_assign`, used for `Dynamic`/`var`
    /// aliasing through an indirect slot).
    RefAssign { dest: u16, src: u16 },
    /// R(dest) := R(left) op R(right), Integer/Double/Byte per operand
    /// kind at runtime.
    Arith { op: ArithOp, dest: u16, left: u16, right: u16 },
    Shift { op: ShiftOp, dest: u16, left: u16, right: u16 },
    Bitwise { op: BitwiseOp, dest: u16, left: u16, right: u16 },
    Compare { op: CompareOp, dest: u16, left: u16, right: u16 },

    /// Unconditional jump by a signed word offset from the next instruction.
    Jump { offset: i16 },
    JumpIfFalse { cond: u16, offset: i16 },
    JumpIfTrue { cond: u16, offset: i16 },

    /// `for i in start..stop by step` setup: validates the step is nonzero
    /// and primes the loop counter register.
    ForSetup { counter: u16, start: u16, stop: u16, step: u16 },
    /// Increments the counter by the loop's step and jumps back if still
    /// within range; falls through when the range is exhausted.
    IntegerFor { counter: u16, stop: u16, step: u16, offset: i16 },

    /// Calls a compiled Lily function. `args_start` is the first of
    /// `argc` contiguous argument registers; the result lands in `dest`.
    CallNative { function: u16, args_start: u16, argc: u16, dest: u16 },
    /// Calls a foreign (Rust) function through the `ffi` trampoline.
    CallForeign { function: u16, args_start: u16, argc: u16, dest: u16 },

    ReturnVal { src: u16 },
    ReturnUnit,
    /// Unwinds this coroutine's nested VM back to its caller (spec §4.8);
    /// distinct from `ReturnVal`, which returns within one VM's own frames.
    ReturnFromVm,

    BuildList { dest: u16, values_start: u16, count: u16 },
    BuildTuple { dest: u16, values_start: u16, count: u16 },
    BuildHash { dest: u16, pairs_start: u16, count: u16 },
    BuildVariant { dest: u16, class_id: u16, values_start: u16, count: u16 },
    NewInstance { dest: u16, class_id: u16 },

    GetItem { dest: u16, container: u16, index: u16 },
    SetItem { container: u16, index: u16, src: u16 },
    GetProperty { dest: u16, instance: u16, prop_id: u16 },
    SetProperty { instance: u16, prop_id: u16, src: u16 },
    GetGlobal { dest: u16, global_id: u16 },
    SetGlobal { global_id: u16, src: u16 },
    GetUpvalue { dest: u16, upvalue_id: u16 },
    SetUpvalue { upvalue_id: u16, src: u16 },
    /// Loads a readonly constant (literal string/double/etc, or a static
    /// function) by pool index.
    GetReadonly { dest: u16, const_id: u16 },

    /// Builds a closure from the static function template at `template_id`,
    /// snapshotting `count` upvalue sources starting at `sources_start`
    /// (each either `Local(cell_reg)` or `Outer(index)`, disambiguated by
    /// a tag word — see `decode_upvalue_sources`).
    MakeFunction { dest: u16, template_id: u16, sources_start: u16, count: u16 },
    /// Promotes the local at `src` to a cell, replacing it in place so
    /// every subsequent read/write of that local goes through the cell.
    MakeCell { src: u16 },

    /// Pushes a try block: `handler_offset` is where control resumes (at
    /// the matching `except`) if a raise unwinds to this call depth.
    PushTry { handler_offset: i16 },
    PopTry,
    /// One `except` clause: `class_id` the clause matches (or `u16::MAX`
    /// for a catch-all), `bind` the register to store the caught value in
    /// (or `u16::MAX` for no binding), `offset` to the next `except`/end.
    Except { class_id: u16, bind: u16, offset: i16 },
    Raise { src: u16 },

    /// `match` over a variant: `value` is inspected, dispatch to
    /// `case_table_id`'s saved jump offsets by class id.
    MatchDispatch { value: u16, case_table_id: u16 },
    /// Decomposes a variant's payload into `count` contiguous destination
    /// registers starting at `dest_start`.
    VariantDecompose { value: u16, dest_start: u16, count: u16 },

    /// `co.yield(v)` (spec §4.8): suspends the coroutine's nested VM back
    /// to its `resume` call site, legal only when exactly two jump records
    /// are live. `dest` receives whatever the matching `resume` delivers
    /// next time this coroutine runs.
    Yield { value: u16, dest: u16 },
}

/// One decoded instruction plus the source line it came from, for
/// traceback construction.
#[derive(Debug, Clone, Copy)]
pub struct Instruction {
    pub line: u32,
    pub op: Opcode,
}

/// A cursor over a function's bytecode buffer. The interpreter owns one per
/// active frame's `pc`; decoding never mutates the buffer.
pub struct Decoder<'a> {
    code: &'a Bytecode,
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(code: &'a Bytecode, pos: usize) -> Self {
        Decoder { code, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn next_word(&mut self) -> u16 {
        let w = self.code[self.pos];
        self.pos += 1;
        w
    }

    fn next_signed(&mut self) -> i16 {
        self.next_word() as i16
    }

    /// Decodes one instruction starting at the cursor's current position
    /// and advances past it. Panics on an out-of-range tag, which can only
    /// mean the bytecode buffer is malformed — compiled code is trusted,
    /// per spec's Non-goals excluding malicious-bytecode sandboxing.
    pub fn decode(&mut self) -> Instruction {
        let line = self.next_word() as u32;
        let tag = self.next_word();
        let op = match tag {
            0 => Opcode::Assign { dest: self.next_word(), src: self.next_word() },
            1 => Opcode::RefAssign { dest: self.next_word(), src: self.next_word() },
            2..=6 => Opcode::Arith {
                op: ARITH_OPS[(tag - 2) as usize],
                dest: self.next_word(),
                left: self.next_word(),
                right: self.next_word(),
            },
            7..=8 => Opcode::Shift {
                op: SHIFT_OPS[(tag - 7) as usize],
                dest: self.next_word(),
                left: self.next_word(),
                right: self.next_word(),
            },
            9..=11 => Opcode::Bitwise {
                op: BITWISE_OPS[(tag - 9) as usize],
                dest: self.next_word(),
                left: self.next_word(),
                right: self.next_word(),
            },
            12..=17 => Opcode::Compare {
                op: COMPARE_OPS[(tag - 12) as usize],
                dest: self.next_word(),
                left: self.next_word(),
                right: self.next_word(),
            },
            18 => Opcode::Jump { offset: self.next_signed() },
            19 => Opcode::JumpIfFalse { cond: self.next_word(), offset: self.next_signed() },
            20 => Opcode::JumpIfTrue { cond: self.next_word(), offset: self.next_signed() },
            21 => Opcode::ForSetup {
                counter: self.next_word(),
                start: self.next_word(),
                stop: self.next_word(),
                step: self.next_word(),
            },
            22 => Opcode::IntegerFor {
                counter: self.next_word(),
                stop: self.next_word(),
                step: self.next_word(),
                offset: self.next_signed(),
            },
            23 => Opcode::CallNative {
                function: self.next_word(),
                args_start: self.next_word(),
                argc: self.next_word(),
                dest: self.next_word(),
            },
            24 => Opcode::CallForeign {
                function: self.next_word(),
                args_start: self.next_word(),
                argc: self.next_word(),
                dest: self.next_word(),
            },
            25 => Opcode::ReturnVal { src: self.next_word() },
            26 => Opcode::ReturnUnit,
            27 => Opcode::ReturnFromVm,
            28 => Opcode::BuildList {
                dest: self.next_word(),
                values_start: self.next_word(),
                count: self.next_word(),
            },
            29 => Opcode::BuildTuple {
                dest: self.next_word(),
                values_start: self.next_word(),
                count: self.next_word(),
            },
            30 => Opcode::BuildHash {
                dest: self.next_word(),
                pairs_start: self.next_word(),
                count: self.next_word(),
            },
            31 => Opcode::BuildVariant {
                dest: self.next_word(),
                class_id: self.next_word(),
                values_start: self.next_word(),
                count: self.next_word(),
            },
            32 => Opcode::NewInstance { dest: self.next_word(), class_id: self.next_word() },
            33 => Opcode::GetItem { dest: self.next_word(), container: self.next_word(), index: self.next_word() },
            34 => Opcode::SetItem { container: self.next_word(), index: self.next_word(), src: self.next_word() },
            35 => Opcode::GetProperty { dest: self.next_word(), instance: self.next_word(), prop_id: self.next_word() },
            36 => Opcode::SetProperty { instance: self.next_word(), prop_id: self.next_word(), src: self.next_word() },
            37 => Opcode::GetGlobal { dest: self.next_word(), global_id: self.next_word() },
            38 => Opcode::SetGlobal { global_id: self.next_word(), src: self.next_word() },
            39 => Opcode::GetUpvalue { dest: self.next_word(), upvalue_id: self.next_word() },
            40 => Opcode::SetUpvalue { upvalue_id: self.next_word(), src: self.next_word() },
            41 => Opcode::GetReadonly { dest: self.next_word(), const_id: self.next_word() },
            42 => Opcode::MakeFunction {
                dest: self.next_word(),
                template_id: self.next_word(),
                sources_start: self.next_word(),
                count: self.next_word(),
            },
            43 => Opcode::MakeCell { src: self.next_word() },
            44 => Opcode::PushTry { handler_offset: self.next_signed() },
            45 => Opcode::PopTry,
            46 => Opcode::Except {
                class_id: self.next_word(),
                bind: self.next_word(),
                offset: self.next_signed(),
            },
            47 => Opcode::Raise { src: self.next_word() },
            48 => Opcode::MatchDispatch { value: self.next_word(), case_table_id: self.next_word() },
            49 => Opcode::VariantDecompose {
                value: self.next_word(),
                dest_start: self.next_word(),
                count: self.next_word(),
            },
            50 => Opcode::Yield { value: self.next_word(), dest: self.next_word() },
            other => panic!("malformed bytecode: unknown opcode tag {other}"),
        };
        Instruction { line, op }
    }
}

const ARITH_OPS: [ArithOp; 5] = [ArithOp::Add, ArithOp::Sub, ArithOp::Mul, ArithOp::Div, ArithOp::Modulo];
const SHIFT_OPS: [ShiftOp; 2] = [ShiftOp::Left, ShiftOp::Right];
const BITWISE_OPS: [BitwiseOp; 3] = [BitwiseOp::And, BitwiseOp::Or, BitwiseOp::Xor];
const COMPARE_OPS: [CompareOp; 6] = [
    CompareOp::Eq,
    CompareOp::NotEq,
    CompareOp::Less,
    CompareOp::LessEq,
    CompareOp::Greater,
    CompareOp::GreaterEq,
];
