//! Exception taxonomy. `RaiseError` is what every fallible operation in
//! `lily-runtime` returns; the raiser converts it into an in-language
//! `Exception` instance (message + traceback) before it reaches a handler.

use std::fmt;

/// The built-in exception classes named in the error handling design, plus
/// user-defined subclasses of `Exception` (identified by name — the class
/// table itself is owned by the out-of-scope symbol table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExceptionClass {
    SyntaxError,
    IOError,
    KeyError,
    IndexError,
    ValueError,
    RuntimeError,
    DivisionByZeroError,
    UserDefined(String),
}

impl ExceptionClass {
    pub fn name(&self) -> &str {
        match self {
            ExceptionClass::SyntaxError => "SyntaxError",
            ExceptionClass::IOError => "IOError",
            ExceptionClass::KeyError => "KeyError",
            ExceptionClass::IndexError => "IndexError",
            ExceptionClass::ValueError => "ValueError",
            ExceptionClass::RuntimeError => "RuntimeError",
            ExceptionClass::DivisionByZeroError => "DivisionByZeroError",
            ExceptionClass::UserDefined(name) => name,
        }
    }

    /// Exact-class match semantics for `arg_isa`/`except` (subclasses do not
    /// match unless `other` names the same user-defined class).
    pub fn matches(&self, other: &ExceptionClass) -> bool {
        self == other
    }
}

impl fmt::Display for ExceptionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An exception in flight. Carries the same `message`/`traceback` pair that
/// a caught `Exception` instance exposes to Lily code.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{class}: {message}")]
pub struct RaiseError {
    pub class: ExceptionClass,
    pub message: String,
    /// `(module, function, line)` triples, innermost frame first.
    pub traceback: Vec<(String, String, u32)>,
}

impl RaiseError {
    pub fn new(class: ExceptionClass, message: impl Into<String>) -> Self {
        RaiseError {
            class,
            message: message.into(),
            traceback: Vec::new(),
        }
    }

    pub fn division_by_zero() -> Self {
        RaiseError::new(
            ExceptionClass::DivisionByZeroError,
            "Attempt to divide by zero.",
        )
    }

    pub fn index_out_of_range(index: i64, len: usize) -> Self {
        RaiseError::new(
            ExceptionClass::IndexError,
            format!("Index {index} is out of range (container has {len} elements)."),
        )
    }

    pub fn key_not_found() -> Self {
        RaiseError::new(ExceptionClass::KeyError, "Key not found.")
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        RaiseError::new(ExceptionClass::RuntimeError, message)
    }

    /// Formats the way `error_message` does: class, message, then one
    /// traceback line per frame, innermost first. Built through `buf`
    /// (spec's "latest formatted error lives in the state's message
    /// buffer") rather than a private `String` the buffer never touches.
    pub fn format_with_trace(&self, buf: &mut crate::msgbuf::MsgBuf) -> String {
        buf.reset();
        buf.add_fmt(format_args!("{}: {}", self.class, self.message));
        for (module, function, line) in &self.traceback {
            buf.add_fmt(format_args!("\n    from {module}:{function} at line {line}"));
        }
        buf.flush()
    }

    /// Formats the way `error_message_no_trace` does: class and message only.
    pub fn format_no_trace(&self, buf: &mut crate::msgbuf::MsgBuf) -> String {
        buf.reset();
        buf.add_fmt(format_args!("{}: {}", self.class, self.message));
        buf.flush()
    }
}
