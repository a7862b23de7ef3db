//! The handler contract: one method per message variant, each with a
//! conformant default.
//!
//! Registrations replace a single method via a `Handler` implementation;
//! there is no nullable-slot table to manage, unlike a callback-pointer
//! design — a trait's default methods already give every unimplemented slot
//! its fallback behavior.
use crate::{
    message::{
        backend::{
            Authentication, BindComplete, CommandComplete, EmptyQueryResponse, ErrorResponse,
            NoData, ParseComplete,
        },
        frontend::{Bind, Close, DescribeTarget, Execute, Parse},
    },
    session::Session,
};

/// The outcome of a handler invocation.
///
/// `FatalSession` instructs the reactor to flush the write buffer and then
/// close the connection; it is not itself an error response (the handler
/// should have already enqueued one, if applicable).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    Continue,
    FatalSession,
}

impl Default for HandlerResult {
    fn default() -> Self {
        Self::Continue
    }
}

/// What the startup handler decided about authentication.
///
/// The handler only decides; the core (not the handler) emits
/// `AuthenticationOk`, the `ParameterStatus` set, `BackendKeyData` and the
/// entry `ReadyForQuery` once authentication actually succeeds, whether that
/// is immediate (`Trust`) or after a `PasswordMessage` (`RequirePassword`).
pub enum StartupDecision {
    /// No credentials required; the session is authenticated immediately.
    Trust,
    /// Challenge the client with `auth`, then await a `PasswordMessage`.
    RequirePassword(Authentication),
    /// Reject the connection outright (the handler has queued an `ErrorResponse`).
    Reject,
}

/// Application logic invoked by the dispatcher for each frontend message
/// variant. Every method has a safe default; override only the ones the
/// application cares about.
pub trait Handler: Send + 'static {
    /// `SSLRequest`, received in `AwaitStartup` before `StartupMessage`. The
    /// default refuses with a single `N` byte (SSL unsupported by the core),
    /// matching §4.2's "SSL unsupported by core; the SSL collaborator may
    /// replace this default". A collaborator that actually negotiates TLS
    /// overrides this to reply `S` and hand the socket off; returning
    /// `FatalSession` closes the connection instead of falling back to
    /// plaintext startup.
    fn ssl_request(&mut self, session: &mut Session) -> HandlerResult {
        session.codec.write_buf_mut().extend_from_slice(b"N");
        HandlerResult::Continue
    }

    /// `CancelRequest`, received on a connection separate from the one it
    /// targets. The core itself performs the `(pid, secret_key)` lookup and
    /// sets the target session's advisory cancel flag (§4.2); this callout
    /// only lets the application observe the attempt, e.g. for auditing. The
    /// originating connection is always closed with no reply afterwards,
    /// regardless of what this method does. The default has no effect.
    fn cancel(&mut self, session: &mut Session, target_pid: u32, target_secret_key: u32) {
        let _ = (session, target_pid, target_secret_key);
    }

    /// `StartupMessage`, once `user`/`database` have been extracted. The
    /// default trusts every connection unconditionally.
    fn startup(&mut self, session: &mut Session, user: &str, database: &str) -> StartupDecision {
        let _ = (session, user, database);
        StartupDecision::Trust
    }

    /// `PasswordMessage` in `AwaitAuth`. The default accepts any password.
    fn password(&mut self, session: &mut Session, password: &str) -> HandlerResult {
        let _ = (session, password);
        HandlerResult::Continue
    }

    /// `Query` — the simple-query cycle. The default treats any text as an
    /// empty query.
    fn query(&mut self, session: &mut Session, sql: &str) -> HandlerResult {
        let _ = sql;
        session.codec.send(EmptyQueryResponse);
        HandlerResult::Continue
    }

    /// `Parse` — create or overwrite a named (or unnamed) prepared statement.
    fn parse(&mut self, session: &mut Session, parse: &Parse) -> HandlerResult {
        session.statements.insert(parse.statement.clone(), crate::session::Statement::from_parse(parse));
        session.codec.send(ParseComplete);
        HandlerResult::Continue
    }

    /// `Bind` — bind a statement to a portal with concrete parameters.
    fn bind(&mut self, session: &mut Session, bind: &Bind) -> HandlerResult {
        session.portals.insert(bind.portal.clone(), crate::session::Portal::from_bind(bind));
        session.codec.send(BindComplete);
        HandlerResult::Continue
    }

    /// `Describe` — report a statement's parameter types, or a portal's row shape.
    fn describe(&mut self, session: &mut Session, target: DescribeTarget, name: &str) -> HandlerResult {
        let _ = (target, name);
        session.codec.send(NoData);
        HandlerResult::Continue
    }

    /// `Execute` — run a portal, emitting up to `max_rows` rows (`0` = unlimited).
    fn execute(&mut self, session: &mut Session, execute: &Execute) -> HandlerResult {
        let _ = execute;
        session.codec.send(CommandComplete::new("SELECT 0"));
        HandlerResult::Continue
    }

    /// `Close` — close a named statement or portal.
    fn close(&mut self, session: &mut Session, close: &Close) -> HandlerResult {
        match close.target {
            DescribeTarget::Statement => session.close_statement(&close.name),
            DescribeTarget::Portal => session.close_portal(&close.name),
        }
        session.codec.send(crate::message::backend::CloseComplete);
        HandlerResult::Continue
    }

    /// `Sync` — beyond the FSM's own state reset, the default has no effect.
    fn sync(&mut self, session: &mut Session) -> HandlerResult {
        let _ = session;
        HandlerResult::Continue
    }

    /// `Terminate` — no reply is ever sent regardless of override; the
    /// return value only controls whether `FatalSession` is recorded before close.
    fn terminate(&mut self, session: &mut Session) -> HandlerResult {
        let _ = session;
        HandlerResult::FatalSession
    }

    /// Any message type the core does not recognize.
    fn unknown(&mut self, session: &mut Session, msgtype: u8) -> HandlerResult {
        session.codec.send(ErrorResponse::new("08P01", format!("unsupported message type {msgtype:?}"), false));
        HandlerResult::Continue
    }
}

/// A handler that implements every slot with its documented default.
pub struct DefaultHandler;

impl Handler for DefaultHandler {}
