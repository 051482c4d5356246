//! Error reporting.
//!
//! Every stage of the pipeline returns one of a small set of error kinds;
//! the pipeline aborts at the first stage boundary where one appears.
//! Diagnostics are emitted where the failure is detected so that loops which
//! keep going after an error can surface more than one line.

use std::fmt;

/// Classifies every failure the linker can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Generic failure or unsupported configuration.
    NotOk,
    /// Malformed ELF or archive input.
    BadInputFile,
    /// Two strong definitions of the same global symbol.
    SymbolRedefined,
    /// Reference to a symbol with no definition.
    SymbolUndefined,
    /// An OS call refused to cooperate.
    SystemFailure,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotOk => "link error",
            ErrorKind::BadInputFile => "bad input file",
            ErrorKind::SymbolRedefined => "global symbol redefined",
            ErrorKind::SymbolUndefined => "reference to undefined symbol",
            ErrorKind::SystemFailure => "operating system refused to cooperate",
        }
    }
}

#[derive(Debug)]
pub struct LinkError {
    pub kind: ErrorKind,
    message: String,
}

impl LinkError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// Builds an error and writes its one diagnostic line to the log sink.
    pub fn report(kind: ErrorKind, message: impl Into<String>) -> Self {
        let err = Self::new(kind, message);
        tracing::error!("{err}");
        err
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for LinkError {}

pub type Result<T> = std::result::Result<T, LinkError>;

/// Keeps the first failure seen while a loop continues collecting diagnostics.
#[derive(Default)]
pub struct FirstError(Option<LinkError>);

impl FirstError {
    pub fn record(&mut self, err: LinkError) {
        self.0.get_or_insert(err);
    }

    pub fn into_result(self) -> Result<()> {
        match self.0 {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
