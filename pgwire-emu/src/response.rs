//! Convenience builders on top of [`crate::message::backend`]'s per-message
//! encoders, for the response shapes handlers assemble most often.
//!
//! Every function here writes into the session's codec write buffer; none
//! touches the socket.
use crate::{
    common::ByteStr,
    message::backend::{
        CommandComplete, DataRow, DataValue, EmptyQueryResponse, ErrorResponse, FieldDescription,
        RowDescription,
    },
    session::Session,
};

/// Build a command tag like `"SELECT 3"` or `"INSERT 0 1"` without an
/// intermediate heap-allocated format string.
pub fn command_tag(command: &str, rows: u64) -> ByteStr {
    let mut buf = itoa::Buffer::new();
    let rows = buf.format(rows);
    let mut tag = String::with_capacity(command.len() + 1 + rows.len());
    tag.push_str(command);
    tag.push(' ');
    tag.push_str(rows);
    ByteStr::from(tag)
}

/// Queue a complete simple-query result set: description, rows, then the
/// command-complete tag. Pass an empty `fields`/`rows` for a DDL-style
/// statement that returns no rows.
pub fn send_result_set(
    session: &mut Session,
    fields: Vec<FieldDescription>,
    rows: Vec<Vec<DataValue>>,
    tag: ByteStr,
) {
    if !fields.is_empty() {
        session.codec.send(RowDescription { fields });
    }
    for values in rows {
        session.codec.send(DataRow { values });
    }
    session.codec.send(CommandComplete { tag });
}

/// Queue the response for a simple-query string with no statements in it.
pub fn send_empty_query(session: &mut Session) {
    session.codec.send(EmptyQueryResponse);
}

/// Queue an `ErrorResponse` from a SQLSTATE and message, non-fatal by default.
pub fn send_application_error(session: &mut Session, sqlstate: &str, message: impl Into<ByteStr>) {
    session.codec.send(ErrorResponse::new(sqlstate, message, false));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_tag_formats_select_with_row_count() {
        assert_eq!(&*command_tag("SELECT", 3), "SELECT 3");
    }

    #[test]
    fn command_tag_formats_zero_rows() {
        assert_eq!(&*command_tag("DELETE", 0), "DELETE 0");
    }

    #[test]
    fn send_result_set_skips_row_description_when_no_fields() {
        let mut session = Session::new(1, 1, 1024);
        session.state = crate::session::SessionState::Ready;
        send_result_set(&mut session, vec![], vec![], command_tag("CREATE TABLE", 0));
        assert_ne!(session.codec.write_buf()[0], b'T');
    }
}
