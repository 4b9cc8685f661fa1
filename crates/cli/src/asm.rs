//! A placeholder textual bytecode assembler.
//!
//! Lexing, parsing, and bytecode emission are out of scope for this
//! runtime core (spec's Non-goals) — there is no real Lily front end
//! anywhere in this workspace. This module exists only so `lily`'s CLI has
//! something to hand the interpreter: a flat text format that maps
//! one-to-one onto `lily_runtime::opcode::Decoder`'s positional tag table,
//! assembled directly into a runnable `FunctionObj`. It is not, and does
//! not attempt to be, Lily source syntax.
//!
//! Format:
//!
//! ```text
//! .function main/add 3
//! 1 add 2 0 1
//! 1 returnval 2
//! ```
//!
//! The header names the function's `module/name` and its register count.
//! Every following non-blank, non-`#`-comment line is
//! `<source line> <mnemonic> <operand>...`; operands are decimal integers
//! (signed, for the handful of mnemonics whose last operand is a jump/try
//! offset). Mnemonics below map one-to-one onto `opcode::Decoder`'s tag
//! table — see that module's doc comment for what each one does.

use std::cell::RefCell;
use std::rc::Rc;

use lily_core::heap::{Bytecode, FunctionObj};

#[derive(Debug, thiserror::Error)]
pub enum AsmError {
    #[error("expected a \".function module/name reg_count\" header as the first non-blank line")]
    MissingHeader,
    #[error("line {line}: malformed \".function\" header: {text:?}")]
    BadHeader { line: usize, text: String },
    #[error("line {line}: unknown mnemonic {mnemonic:?}")]
    UnknownMnemonic { line: usize, mnemonic: String },
    #[error("line {line}: {mnemonic} takes {expected} operand(s), got {got}")]
    WrongArity { line: usize, mnemonic: String, expected: usize, got: usize },
    #[error("line {line}: operand {operand:?} is not a valid integer")]
    BadOperand { line: usize, operand: String },
}

/// Maps a mnemonic onto `(tag, operand_count)`, matching
/// `opcode::Decoder::decode`'s positional layout exactly.
fn lookup(mnemonic: &str) -> Option<(u16, usize)> {
    Some(match mnemonic {
        "assign" => (0, 2),
        "refassign" => (1, 2),
        "add" => (2, 3),
        "sub" => (3, 3),
        "mul" => (4, 3),
        "div" => (5, 3),
        "mod" => (6, 3),
        "shl" => (7, 3),
        "shr" => (8, 3),
        "band" => (9, 3),
        "bor" => (10, 3),
        "bxor" => (11, 3),
        "eq" => (12, 3),
        "neq" => (13, 3),
        "lt" => (14, 3),
        "le" => (15, 3),
        "gt" => (16, 3),
        "ge" => (17, 3),
        "jump" => (18, 1),
        "jumpiffalse" => (19, 2),
        "jumpiftrue" => (20, 2),
        "forsetup" => (21, 4),
        "integerfor" => (22, 4),
        "callnative" => (23, 4),
        "callforeign" => (24, 4),
        "returnval" => (25, 1),
        "returnunit" => (26, 0),
        "returnfromvm" => (27, 0),
        "buildlist" => (28, 3),
        "buildtuple" => (29, 3),
        "buildhash" => (30, 3),
        "buildvariant" => (31, 4),
        "newinstance" => (32, 2),
        "getitem" => (33, 3),
        "setitem" => (34, 3),
        "getproperty" => (35, 3),
        "setproperty" => (36, 3),
        "getglobal" => (37, 2),
        "setglobal" => (38, 2),
        "getupvalue" => (39, 2),
        "setupvalue" => (40, 2),
        "getreadonly" => (41, 2),
        "makefunction" => (42, 4),
        "makecell" => (43, 1),
        "pushtry" => (44, 1),
        "poptry" => (45, 0),
        "except" => (46, 3),
        "raise" => (47, 1),
        "matchdispatch" => (48, 2),
        "variantdecompose" => (49, 3),
        "yield" => (50, 2),
        _ => return None,
    })
}

/// Assembles `source` into a runnable native `FunctionObj`.
pub fn assemble(source: &str) -> Result<Rc<RefCell<FunctionObj>>, AsmError> {
    let mut lines = source.lines().enumerate().map(|(i, l)| (i + 1, l.trim()));

    let (module, name, reg_count) = loop {
        match lines.next() {
            None => return Err(AsmError::MissingHeader),
            Some((_, l)) if l.is_empty() || l.starts_with('#') => continue,
            Some((n, l)) => break parse_header(n, l)?,
        }
    };

    let mut code: Bytecode = Vec::new();
    for (line_no, line) in lines {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        emit_instruction(&mut code, line_no, line)?;
    }

    Ok(Rc::new(RefCell::new(FunctionObj::native(reg_count, code, &module, &name))))
}

fn parse_header(line: usize, text: &str) -> Result<(String, String, u32), AsmError> {
    let rest = text.strip_prefix(".function").map(str::trim);
    let Some(rest) = rest else {
        return Err(AsmError::BadHeader { line, text: text.to_string() });
    };
    let mut parts = rest.split_whitespace();
    let qualified = parts.next();
    let reg_count = parts.next();
    let (Some(qualified), Some(reg_count), None) = (qualified, reg_count, parts.next()) else {
        return Err(AsmError::BadHeader { line, text: text.to_string() });
    };
    let Some((module, name)) = qualified.split_once('/') else {
        return Err(AsmError::BadHeader { line, text: text.to_string() });
    };
    let reg_count: u32 = reg_count
        .parse()
        .map_err(|_| AsmError::BadHeader { line, text: text.to_string() })?;
    Ok((module.to_string(), name.to_string(), reg_count))
}

fn emit_instruction(code: &mut Bytecode, line: usize, text: &str) -> Result<(), AsmError> {
    let mut tokens = text.split_whitespace();
    let mnemonic = tokens.next().expect("non-empty line has at least one token");
    let (tag, expected) = lookup(mnemonic)
        .ok_or_else(|| AsmError::UnknownMnemonic { line, mnemonic: mnemonic.to_string() })?;

    let operands: Vec<&str> = tokens.collect();
    if operands.len() != expected {
        return Err(AsmError::WrongArity {
            line,
            mnemonic: mnemonic.to_string(),
            expected,
            got: operands.len(),
        });
    }

    code.push(line as u16);
    code.push(tag);
    for operand in operands {
        let value: i32 = operand
            .parse()
            .map_err(|_| AsmError::BadOperand { line, operand: operand.to_string() })?;
        code.push(value as u16);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lily_core::value::Value;
    use lily_runtime::interp::{Interpreter, Shared};
    use std::rc::Rc;

    fn shared() -> Rc<RefCell<Shared>> {
        Rc::new(RefCell::new(Shared::new(1_000_000, 4, [0u8; 16])))
    }

    #[test]
    fn assembles_and_runs_a_trivial_add_function() {
        let source = "\
            .function main/add 3\n\
            1 add 2 0 1\n\
            1 returnval 2\n\
        ";
        let f = assemble(source).unwrap();
        let mut vm = Interpreter::new(shared());
        let result = vm.execute(&f, &[Value::Integer(4), Value::Integer(5)]).unwrap();
        assert_eq!(result.as_integer(), Some(9));
    }

    #[test]
    fn skips_blank_lines_and_comments() {
        let source = "\
            # a trivial doubling function\n\
            \n\
            .function main/double 2\n\
            # double the argument\n\
            1 add 1 0 0\n\
            \n\
            1 returnval 1\n\
        ";
        let f = assemble(source).unwrap();
        let mut vm = Interpreter::new(shared());
        let result = vm.execute(&f, &[Value::Integer(6)]).unwrap();
        assert_eq!(result.as_integer(), Some(12));
    }

    #[test]
    fn negative_jump_offsets_round_trip_through_u16() {
        let source = "\
            .function main/loop 1\n\
            1 jump -3\n\
        ";
        // A signed operand round-trips through `as u16`/`as i16` the same
        // way `opcode::Decoder::next_signed` does.
        let f = assemble(source).unwrap();
        assert_eq!(f.borrow().code.as_ref().unwrap()[2], (-3i16) as u16);
    }

    #[test]
    fn missing_header_is_an_error() {
        let err = assemble("1 returnunit\n").unwrap_err();
        assert!(matches!(err, AsmError::MissingHeader));
    }

    #[test]
    fn wrong_arity_is_an_error() {
        let source = "\
            .function main/bad 2\n\
            1 add 0 1\n\
        ";
        let err = assemble(source).unwrap_err();
        assert!(matches!(err, AsmError::WrongArity { expected: 3, got: 2, .. }));
    }

    #[test]
    fn unknown_mnemonic_is_an_error() {
        let source = "\
            .function main/bad 1\n\
            1 frobnicate 0\n\
        ";
        let err = assemble(source).unwrap_err();
        assert!(matches!(err, AsmError::UnknownMnemonic { .. }));
    }
}
