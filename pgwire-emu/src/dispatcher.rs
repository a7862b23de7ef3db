//! Routes a decoded frontend message to the registered [`Handler`], enforcing
//! the session FSM's legality rules first.
use bytes::Bytes;

use crate::{
    common::verbose,
    error::ProtocolError,
    handler::{Handler, HandlerResult},
    message::frontend::{Describe, FrontendMessage},
    message::backend::{ErrorResponse, ReadyForQuery},
    session::{Session, SessionState},
};

/// Decode and dispatch one typed frame already known to be past the startup
/// phase. Returns `FatalSession` when the connection must close once the
/// write buffer drains.
pub fn dispatch(handler: &mut impl Handler, session: &mut Session, msgtype: u8, body: Bytes) -> HandlerResult {
    verbose!(msgtype = ?(msgtype as char), len = body.len(), "inbound frame");

    if !session.permits(msgtype) {
        let err = ProtocolError::unknown_message(msgtype);
        send_error(session, &err);
        return if err.fatal { HandlerResult::FatalSession } else { HandlerResult::Continue };
    }

    if session.state == SessionState::ErrorExtended && msgtype != b'S' && msgtype != b'X' {
        // swallowed until Sync, per the ErrorExtended row of the FSM table.
        return HandlerResult::Continue;
    }

    let msg = match FrontendMessage::decode(msgtype, body) {
        Ok(msg) => msg,
        Err(err) => {
            send_error(session, &err);
            return if err.fatal { HandlerResult::FatalSession } else { HandlerResult::Continue };
        }
    };

    if msg.is_extended_query() {
        session.begin_extended_if_needed();
    }

    let result = dispatch_decoded(handler, session, msg);

    if result == HandlerResult::FatalSession {
        session.closing = true;
    }

    result
}

fn dispatch_decoded(handler: &mut impl Handler, session: &mut Session, msg: FrontendMessage) -> HandlerResult {
    match msg {
        FrontendMessage::Password(p) => handler.password(session, &p.password),
        FrontendMessage::Query(q) => {
            let result = if session.cancel_requested {
                cancel(session)
            } else {
                handler.query(session, &q.sql)
            };
            // The simple-query cycle always ends in exactly one ReadyForQuery,
            // cancelled or not — only Sync defers it (InExtended/ErrorExtended).
            session.codec.send(ReadyForQuery { status: session.transaction_status });
            result
        }
        FrontendMessage::Parse(p) => run_extended(handler, session, |h, s| h.parse(s, &p)),
        FrontendMessage::Bind(b) => run_extended(handler, session, |h, s| h.bind(s, &b)),
        FrontendMessage::Describe(d) => {
            let Describe { target, name } = d;
            run_extended(handler, session, |h, s| h.describe(s, target, &name))
        }
        FrontendMessage::Execute(e) => run_extended(handler, session, |h, s| h.execute(s, &e)),
        FrontendMessage::Close(c) => run_extended(handler, session, |h, s| h.close(s, &c)),
        FrontendMessage::Sync => {
            session.sync();
            let result = handler.sync(session);
            session.codec.send(ReadyForQuery { status: session.transaction_status });
            result
        }
        FrontendMessage::Flush => HandlerResult::Continue,
        FrontendMessage::Terminate => handler.terminate(session),
        FrontendMessage::Unknown(msgtype, _) => handler.unknown(session, msgtype),
    }
}

/// Run one extended-query step; on handler error move to `ErrorExtended` and
/// emit exactly one `ErrorResponse`, per §4.2's InExtended transitions.
fn run_extended(
    handler: &mut impl Handler,
    session: &mut Session,
    f: impl FnOnce(&mut dyn Handler, &mut Session) -> HandlerResult,
) -> HandlerResult {
    if session.cancel_requested {
        return cancel(session);
    }
    let result = f(handler, session);
    if result == HandlerResult::FatalSession {
        session.fail_extended();
    }
    result
}

fn cancel(session: &mut Session) -> HandlerResult {
    session.cancel_requested = false;
    send_error(session, &ProtocolError::query_canceled());
    session.fail_extended();
    HandlerResult::Continue
}

fn send_error(session: &mut Session, err: &ProtocolError) {
    session.codec.send(ErrorResponse::new(err.sqlstate, err.message.clone(), err.fatal));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::DefaultHandler;

    fn session() -> Session {
        let mut s = Session::new(1, 2, 1024);
        s.state = SessionState::Ready;
        s
    }

    #[test]
    fn unknown_message_in_ready_gets_nonfatal_error() {
        let mut handler = DefaultHandler;
        let mut s = session();
        let result = dispatch(&mut handler, &mut s, b'?', Bytes::new());
        assert_eq!(result, HandlerResult::Continue);
        assert!(!s.codec.write_buf().is_empty());
    }

    #[test]
    fn terminate_is_fatal_and_marks_session_closing() {
        let mut handler = DefaultHandler;
        let mut s = session();
        let result = dispatch(&mut handler, &mut s, b'X', Bytes::new());
        assert_eq!(result, HandlerResult::FatalSession);
        assert!(s.closing);
    }

    #[test]
    fn terminate_consults_the_handler_override() {
        struct KeepReading;
        impl Handler for KeepReading {
            fn terminate(&mut self, _session: &mut Session) -> HandlerResult {
                HandlerResult::Continue
            }
        }

        let mut handler = KeepReading;
        let mut s = session();
        let result = dispatch(&mut handler, &mut s, b'X', Bytes::new());
        assert_eq!(result, HandlerResult::Continue);
        assert!(!s.closing);
    }

    #[test]
    fn sync_emits_ready_for_query() {
        let mut handler = DefaultHandler;
        let mut s = session();
        dispatch(&mut handler, &mut s, b'S', Bytes::new());
        assert_eq!(s.codec.write_buf()[0], b'Z');
    }

    #[test]
    fn query_while_cancel_requested_emits_query_canceled() {
        let mut handler = DefaultHandler;
        let mut s = session();
        s.cancel_requested = true;
        dispatch(&mut handler, &mut s, b'Q', Bytes::from_static(b"select 1\0"));
        assert!(s.codec.write_buf().windows(5).any(|w| w == b"57014"));
    }

    #[test]
    fn cancelled_query_still_closes_its_cycle_with_ready_for_query() {
        let mut handler = DefaultHandler;
        let mut s = session();
        s.cancel_requested = true;
        dispatch(&mut handler, &mut s, b'Q', Bytes::from_static(b"select 1\0"));
        assert_eq!(*s.codec.write_buf().last().unwrap(), b'I');
        let zed_count = s.codec.write_buf().iter().filter(|&&b| b == b'Z').count();
        assert_eq!(zed_count, 1, "exactly one ReadyForQuery must follow a cancelled Query");
    }

    #[test]
    fn message_not_permitted_in_error_extended_is_swallowed() {
        let mut handler = DefaultHandler;
        let mut s = session();
        s.state = SessionState::ErrorExtended;
        let before = s.codec.write_buf().len();
        dispatch(&mut handler, &mut s, b'E', Bytes::from_static(b"\0\0\0\0\0"));
        assert_eq!(s.codec.write_buf().len(), before);
    }
}
