use failure::{Backtrace, Context, Fail};
use std::fmt;

#[derive(Debug)]
pub(crate) struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Debug, PartialEq, Fail)]
pub(crate) enum ErrorKind {
    #[fail(display = "parse error: {}", _0)]
    Parse(String),
    #[fail(display = "codegen error: {}", _0)]
    Codegen(String),
    #[fail(display = "execution error: {}", _0)]
    Exec(String),
}

impl Error {
    pub(crate) fn kind(&self) -> &ErrorKind {
        self.inner.get_context()
    }
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            inner: Context::new(kind),
        }
    }
}

pub(crate) type Result<T> = std::result::Result<T, Error>;
