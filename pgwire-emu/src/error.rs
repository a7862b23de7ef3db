//! `pgwire-emu` error types.
use std::{backtrace::Backtrace, fmt, io};

/// A specialized [`Result`] type for `pgwire-emu` operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible errors from `pgwire-emu`.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Attach a description of where the error occurred.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }
}

/// All possible error kinds from `pgwire-emu`.
pub enum ErrorKind {
    /// A malformed frame, or a message illegal for the session's current state.
    Protocol(ProtocolError),
    /// Transport-level failure (peer reset, write failure, oversize buffer).
    Io(io::Error),
    /// A malformed [`ServerConfig`][crate::config::ServerConfig] value.
    Config(ConfigError),
    /// A [`HandlerFactory`][crate::reactor::HandlerFactory] failed to build a
    /// [`Handler`][crate::handler::Handler] for an accepted connection.
    Handler(HandlerError),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<ConfigError>e => ErrorKind::Config(e));
from!(<HandlerError>e => ErrorKind::Handler(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Config(e) => e.fmt(f),
            Self::Handler(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// A protocol-level violation: a malformed frame, an unsupported startup
/// version, or a message illegal for the session's current FSM state.
///
/// Every `ProtocolError` carries a SQLSTATE and converts directly into the
/// `ErrorResponse` sent back to the client (see [`crate::response`]).
#[derive(Debug, Clone)]
pub struct ProtocolError {
    pub sqlstate: &'static str,
    pub message: String,
    /// `FATAL` severity mandates the session close after the response is flushed.
    pub fatal: bool,
}

impl ProtocolError {
    /// `08P01` — malformed frame, truncated field, or unknown startup magic.
    pub fn violation(message: impl Into<String>) -> Self {
        Self { sqlstate: "08P01", message: message.into(), fatal: true }
    }

    /// `08P01`, but the session is kept alive (e.g. an unknown message in `Ready`).
    pub fn unknown_message(msgtype: u8) -> Self {
        Self {
            sqlstate: "08P01",
            message: format!("unrecognized message type: {:?}", msgtype as char),
            fatal: false,
        }
    }

    /// `28000` — required `user` startup parameter absent.
    pub fn missing_user() -> Self {
        Self {
            sqlstate: "28000",
            message: "no PostgreSQL user name specified in startup packet".into(),
            fatal: true,
        }
    }

    /// `57014` — the session's advisory cancel flag was observed set.
    pub fn query_canceled() -> Self {
        Self { sqlstate: "57014", message: "canceling statement due to user request".into(), fatal: false }
    }

    /// An application-supplied error (handler-provided SQLSTATE), non-fatal by default.
    pub fn application(sqlstate: &'static str, message: impl Into<String>) -> Self {
        Self { sqlstate, message: message.into(), fatal: false }
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.sqlstate, self.message)
    }
}

/// Error parsing or validating a [`ServerConfig`][crate::config::ServerConfig].
pub struct ConfigError {
    pub(crate) reason: String,
}

impl ConfigError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl std::error::Error for ConfigError { }

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.reason)
    }
}

impl fmt::Debug for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Error building a [`Handler`][crate::handler::Handler] for an accepted
/// connection. A [`HandlerFactory`][crate::reactor::HandlerFactory] backed by
/// a pooled or fallible resource (a connection pool, a config reload) can
/// fail this way; the reactor logs it and drops the connection the same way
/// it handles an `accept` failure, per §4.4.
pub struct HandlerError {
    pub(crate) reason: String,
}

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl std::error::Error for HandlerError { }

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler construction failed: {}", self.reason)
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
