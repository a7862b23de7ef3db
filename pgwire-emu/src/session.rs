//! Per-connection state: the FSM, named statements/portals, and transaction status.
use std::collections::HashMap;

use crate::{
    codec::Codec,
    common::ByteStr,
    message::backend::TransactionStatus,
    message::frontend::{Bind, Parse},
};

/// The session's place in the startup/authentication/query-cycle FSM.
///
/// <https://www.postgresql.org/docs/current/protocol-flow.html>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitStartup,
    SslNegotiating,
    AwaitAuth,
    Ready,
    InExtended,
    ErrorExtended,
}

/// A named prepared statement, created by `Parse` and consumed by `Bind`/`Describe`.
///
/// The empty name denotes the unnamed statement, silently overwritten by the
/// next `Parse` with no explicit `Close`.
#[derive(Debug, Clone)]
pub struct Statement {
    pub sql: ByteStr,
    pub param_oids: Vec<u32>,
}

impl Statement {
    pub fn from_parse(parse: &Parse) -> Self {
        Self { sql: parse.sql.clone(), param_oids: parse.param_oids.clone() }
    }
}

/// A portal: a statement bound to concrete parameter values and result formats.
#[derive(Debug, Clone)]
pub struct Portal {
    pub statement: ByteStr,
    pub param_formats: Vec<i16>,
    pub params: Vec<Option<bytes::Bytes>>,
    pub result_formats: Vec<i16>,
    /// Set when a previous `Execute` stopped at `max_rows` with rows remaining.
    pub suspended: bool,
}

impl Portal {
    pub fn from_bind(bind: &Bind) -> Self {
        Self {
            statement: bind.statement.clone(),
            param_formats: bind.param_formats.clone(),
            params: bind.params.clone(),
            result_formats: bind.result_formats.clone(),
            suspended: false,
        }
    }
}

/// A live connection: its wire codec, FSM state, identity, and named objects.
///
/// Owned exclusively by the task driving it; the reactor's live-session table
/// holds only a cancel handle, never the `Session` itself (see
/// [`crate::reactor`]).
pub struct Session {
    pub codec: Codec,
    pub state: SessionState,
    pub pid: u32,
    pub secret_key: u32,
    pub user: Option<ByteStr>,
    pub database: Option<ByteStr>,
    pub transaction_status: TransactionStatus,
    pub statements: HashMap<ByteStr, Statement>,
    pub portals: HashMap<ByteStr, Portal>,
    /// Set by the reactor on a matching `CancelRequest`; cleared once observed.
    pub cancel_requested: bool,
    /// Set once the handler or FSM has decided this connection must close
    /// after the write buffer drains.
    pub closing: bool,
}

impl Session {
    pub fn new(pid: u32, secret_key: u32, max_frame_len: u32) -> Self {
        Self {
            codec: Codec::with_max_frame_len(max_frame_len),
            state: SessionState::AwaitStartup,
            pid,
            secret_key,
            user: None,
            database: None,
            transaction_status: TransactionStatus::Idle,
            statements: HashMap::new(),
            portals: HashMap::new(),
            cancel_requested: false,
            closing: false,
        }
    }

    /// Whether `msgtype` is legal to receive in the current state, per the
    /// permitted-inbound table. `AwaitStartup`/`SslNegotiating` are handled
    /// separately since their first frame is untyped.
    pub fn permits(&self, msgtype: u8) -> bool {
        use SessionState::*;
        match self.state {
            AwaitStartup | SslNegotiating => false,
            AwaitAuth => msgtype == b'p',
            // ErrorExtended accepts the same message set as Ready/InExtended;
            // everything but Sync/Terminate is then discarded unacted-upon
            // rather than rejected (see `dispatch`'s post-permits check).
            Ready | InExtended | ErrorExtended => matches!(
                msgtype,
                b'Q' | b'P' | b'B' | b'D' | b'E' | b'C' | b'S' | b'H' | b'X'
            ),
        }
    }

    /// Enter `InExtended` the first time an extended-query message arrives
    /// in `Ready`; a no-op from any other state.
    pub fn begin_extended_if_needed(&mut self) {
        if self.state == SessionState::Ready {
            self.state = SessionState::InExtended;
        }
    }

    /// Move to `ErrorExtended` after a handler error during an extended-query burst.
    pub fn fail_extended(&mut self) {
        if self.state == SessionState::InExtended {
            self.state = SessionState::ErrorExtended;
        }
    }

    /// `Sync`: clear any extended-query error state and return to `Ready`.
    pub fn sync(&mut self) {
        self.state = SessionState::Ready;
    }

    /// Drop the statement (and any portal bound to it) by name.
    pub fn close_statement(&mut self, name: &str) {
        self.statements.remove(name);
        self.portals.retain(|_, portal| portal.statement.as_ref() != name);
    }

    pub fn close_portal(&mut self, name: &str) {
        self.portals.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn await_auth_only_permits_password_message() {
        let s = Session::new(1, 1, 1024);
        assert!(s.permits(b'p'));
        assert!(!s.permits(b'Q'));
    }

    #[test]
    fn error_extended_permits_the_same_set_as_ready() {
        let mut s = Session::new(1, 1, 1024);
        s.state = SessionState::ErrorExtended;
        assert!(s.permits(b'S'));
        assert!(s.permits(b'X'));
        assert!(s.permits(b'P'));
        assert!(!s.permits(b'Z'));
    }

    #[test]
    fn closing_a_statement_drops_its_portals() {
        let mut s = Session::new(1, 1, 1024);
        s.statements.insert(ByteStr::copy_from_str("s"), Statement {
            sql: ByteStr::copy_from_str("select 1"),
            param_oids: vec![],
        });
        s.portals.insert(ByteStr::copy_from_str(""), Portal {
            statement: ByteStr::copy_from_str("s"),
            param_formats: vec![],
            params: vec![],
            result_formats: vec![],
            suspended: false,
        });
        s.close_statement("s");
        assert!(s.statements.is_empty());
        assert!(s.portals.is_empty());
    }
}
