//! Messages this server sends to a client.
//!
//! Bit-exact layouts: <https://www.postgresql.org/docs/current/protocol-message-formats.html>.
use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    codec::Encode,
    common::ByteStr,
    ext::{BufMutExt, StrExt, UsizeExt},
};

/// One column's wire type/format description, part of [`RowDescription`].
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: ByteStr,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: i32,
    pub type_size: i16,
    pub type_mod: i32,
    pub format: i16,
}

impl FieldDescription {
    /// A minimal description for an untyped text column, as used by the
    /// default query handler.
    pub fn text(name: impl Into<ByteStr>) -> Self {
        Self {
            name: name.into(),
            table_oid: 0,
            column_attr: 0,
            type_oid: 0,
            type_size: -1,
            type_mod: -1,
            format: 0,
        }
    }

    fn wire_len(&self) -> u32 {
        self.name.nul_string_len() + 4 + 2 + 4 + 2 + 4 + 2
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_nul_string(&self.name);
        buf.put_i32(self.table_oid);
        buf.put_i16(self.column_attr);
        buf.put_i32(self.type_oid);
        buf.put_i16(self.type_size);
        buf.put_i32(self.type_mod);
        buf.put_i16(self.format);
    }
}

/// `R` — any `AuthenticationRequest` sub-type.
#[derive(Debug, Clone)]
pub enum Authentication {
    Ok,
    CleartextPassword,
    /// MD5 salted password, carrying the 4-byte salt.
    Md5Password([u8; 4]),
    /// SASL mechanism negotiation: a NUL-terminated list of mechanism names.
    Sasl(Vec<ByteStr>),
    SaslContinue(Bytes),
    SaslFinal(Bytes),
}

impl Encode for Authentication {
    const MSGTYPE: u8 = b'R';

    fn size_hint(&self) -> u32 {
        4 + match self {
            Self::Ok | Self::CleartextPassword => 0,
            Self::Md5Password(_) => 4,
            Self::Sasl(mechs) => mechs.iter().map(|m| m.nul_string_len()).sum::<u32>() + 1,
            Self::SaslContinue(b) | Self::SaslFinal(b) => b.len().to_u32(),
        }
    }

    fn encode(self, buf: &mut BytesMut) {
        match self {
            Self::Ok => buf.put_i32(0),
            Self::CleartextPassword => buf.put_i32(3),
            Self::Md5Password(salt) => {
                buf.put_i32(5);
                buf.put_slice(&salt);
            }
            Self::Sasl(mechs) => {
                buf.put_i32(10);
                for mech in mechs {
                    buf.put_nul_string(&mech);
                }
                buf.put_u8(0);
            }
            Self::SaslContinue(body) => {
                buf.put_i32(11);
                buf.put_slice(&body);
            }
            Self::SaslFinal(body) => {
                buf.put_i32(12);
                buf.put_slice(&body);
            }
        }
    }
}

/// `S` — one run-time parameter report.
#[derive(Debug, Clone)]
pub struct ParameterStatus {
    pub name: ByteStr,
    pub value: ByteStr,
}

impl Encode for ParameterStatus {
    const MSGTYPE: u8 = b'S';

    fn size_hint(&self) -> u32 {
        self.name.nul_string_len() + self.value.nul_string_len()
    }

    fn encode(self, buf: &mut BytesMut) {
        buf.put_nul_string(&self.name);
        buf.put_nul_string(&self.value);
    }
}

/// `K` — the (pid, secret) pair a later `CancelRequest` must present.
#[derive(Debug, Clone, Copy)]
pub struct BackendKeyData {
    pub pid: i32,
    pub secret_key: i32,
}

impl Encode for BackendKeyData {
    const MSGTYPE: u8 = b'K';

    fn size_hint(&self) -> u32 {
        8
    }

    fn encode(self, buf: &mut BytesMut) {
        buf.put_i32(self.pid);
        buf.put_i32(self.secret_key);
    }
}

/// Transaction status byte carried by [`ReadyForQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

impl TransactionStatus {
    fn byte(self) -> u8 {
        match self {
            Self::Idle => b'I',
            Self::InTransaction => b'T',
            Self::Failed => b'E',
        }
    }
}

/// `Z` — marks the end of a message cycle; the session is ready for the next one.
#[derive(Debug, Clone, Copy)]
pub struct ReadyForQuery {
    pub status: TransactionStatus,
}

impl Encode for ReadyForQuery {
    const MSGTYPE: u8 = b'Z';

    fn size_hint(&self) -> u32 {
        1
    }

    fn encode(self, buf: &mut BytesMut) {
        buf.put_u8(self.status.byte());
    }
}

/// `T` — describes the columns of the rows that follow.
#[derive(Debug, Clone, Default)]
pub struct RowDescription {
    pub fields: Vec<FieldDescription>,
}

impl Encode for RowDescription {
    const MSGTYPE: u8 = b'T';

    fn size_hint(&self) -> u32 {
        2 + self.fields.iter().map(FieldDescription::wire_len).sum::<u32>()
    }

    fn encode(self, buf: &mut BytesMut) {
        buf.put_i16(self.fields.len().to_u16() as i16);
        for field in &self.fields {
            field.encode(buf);
        }
    }
}

/// One column value, or `None` for SQL `NULL`.
pub type DataValue = Option<Bytes>;

/// `D` — one row of query results.
#[derive(Debug, Clone, Default)]
pub struct DataRow {
    pub values: Vec<DataValue>,
}

impl Encode for DataRow {
    const MSGTYPE: u8 = b'D';

    fn size_hint(&self) -> u32 {
        2 + self
            .values
            .iter()
            .map(|v| 4 + v.as_ref().map(|b| b.len().to_u32()).unwrap_or(0))
            .sum::<u32>()
    }

    fn encode(self, buf: &mut BytesMut) {
        buf.put_i16(self.values.len().to_u16() as i16);
        for value in self.values {
            match value {
                Some(bytes) => {
                    buf.put_i32(bytes.len().to_u32() as i32);
                    buf.put_slice(&bytes);
                }
                None => buf.put_i32(-1),
            }
        }
    }
}

/// `C` — the command tag of a completed statement, e.g. `"SELECT 3"`.
#[derive(Debug, Clone)]
pub struct CommandComplete {
    pub tag: ByteStr,
}

impl CommandComplete {
    pub fn new(tag: impl Into<ByteStr>) -> Self {
        Self { tag: tag.into() }
    }
}

impl Encode for CommandComplete {
    const MSGTYPE: u8 = b'C';

    fn size_hint(&self) -> u32 {
        self.tag.nul_string_len()
    }

    fn encode(self, buf: &mut BytesMut) {
        buf.put_nul_string(&self.tag);
    }
}

/// `I` — the simple-query string contained no statements.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyQueryResponse;

impl Encode for EmptyQueryResponse {
    const MSGTYPE: u8 = b'I';

    fn size_hint(&self) -> u32 {
        0
    }

    fn encode(self, _buf: &mut BytesMut) {}
}

/// One `(field_code, value)` pair of an `ErrorResponse`/`NoticeResponse`.
///
/// Field codes are documented at
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>;
/// the notable ones are `S` (severity), `C` (SQLSTATE), `M` (message).
pub type NoticeField = (u8, ByteStr);

fn notice_size_hint(fields: &[NoticeField]) -> u32 {
    1 + fields.iter().map(|(_, v)| 1 + v.nul_string_len()).sum::<u32>()
}

fn notice_encode(fields: Vec<NoticeField>, buf: &mut BytesMut) {
    for (code, value) in fields {
        buf.put_u8(code);
        buf.put_nul_string(&value);
    }
    buf.put_u8(0);
}

/// `E` — a condition severe enough to abort the current command (or the session).
#[derive(Debug, Clone, Default)]
pub struct ErrorResponse {
    pub fields: Vec<NoticeField>,
}

impl ErrorResponse {
    /// Build the mandatory `S`/`V`/`C`/`M` fields from a SQLSTATE and message.
    pub fn new(sqlstate: &str, message: impl Into<ByteStr>, fatal: bool) -> Self {
        let severity = if fatal { "FATAL" } else { "ERROR" };
        Self {
            fields: vec![
                (b'S', ByteStr::copy_from_str(severity)),
                (b'V', ByteStr::copy_from_str(severity)),
                (b'C', ByteStr::copy_from_str(sqlstate)),
                (b'M', message.into()),
            ],
        }
    }
}

impl Encode for ErrorResponse {
    const MSGTYPE: u8 = b'E';

    fn size_hint(&self) -> u32 {
        notice_size_hint(&self.fields)
    }

    fn encode(self, buf: &mut BytesMut) {
        notice_encode(self.fields, buf);
    }
}

/// `N` — an advisory condition that does not abort the current command.
#[derive(Debug, Clone, Default)]
pub struct NoticeResponse {
    pub fields: Vec<NoticeField>,
}

impl Encode for NoticeResponse {
    const MSGTYPE: u8 = b'N';

    fn size_hint(&self) -> u32 {
        notice_size_hint(&self.fields)
    }

    fn encode(self, buf: &mut BytesMut) {
        notice_encode(self.fields, buf);
    }
}

macro_rules! empty_message {
    ($name:ident, $msgtype:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl Encode for $name {
            const MSGTYPE: u8 = $msgtype;

            fn size_hint(&self) -> u32 {
                0
            }

            fn encode(self, _buf: &mut BytesMut) {}
        }
    };
}

empty_message!(ParseComplete, b'1', "`1` — the named statement was parsed successfully.");
empty_message!(BindComplete, b'2', "`2` — the portal was bound successfully.");
empty_message!(CloseComplete, b'3', "`3` — the named statement/portal was closed.");
empty_message!(NoData, b'n', "`n` — a `Describe` target has no row description.");
empty_message!(PortalSuspended, b's', "`s` — execution stopped at `max_rows`, more rows remain.");
empty_message!(CopyDone, b'c', "`c` — a copy-in/out stream completed successfully.");

/// `t` — the parameter types a prepared statement expects.
#[derive(Debug, Clone, Default)]
pub struct ParameterDescription {
    pub type_oids: Vec<i32>,
}

impl Encode for ParameterDescription {
    const MSGTYPE: u8 = b't';

    fn size_hint(&self) -> u32 {
        2 + 4 * self.type_oids.len().to_u32()
    }

    fn encode(self, buf: &mut BytesMut) {
        buf.put_i16(self.type_oids.len().to_u16() as i16);
        for oid in self.type_oids {
            buf.put_i32(oid);
        }
    }
}

/// Which copy-style response is being sent; shared by `CopyIn`/`CopyOut`/`CopyBoth`.
#[derive(Debug, Clone)]
pub struct CopyDescription {
    pub format: i8,
    pub column_formats: Vec<i16>,
}

impl CopyDescription {
    fn size_hint(&self) -> u32 {
        1 + 2 + 2 * self.column_formats.len().to_u32()
    }

    fn encode(self, buf: &mut BytesMut) {
        buf.put_i8(self.format);
        buf.put_i16(self.column_formats.len().to_u16() as i16);
        for f in self.column_formats {
            buf.put_i16(f);
        }
    }
}

macro_rules! copy_message {
    ($name:ident, $msgtype:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone)]
        pub struct $name(pub CopyDescription);

        impl Encode for $name {
            const MSGTYPE: u8 = $msgtype;

            fn size_hint(&self) -> u32 {
                self.0.size_hint()
            }

            fn encode(self, buf: &mut BytesMut) {
                self.0.encode(buf)
            }
        }
    };
}

copy_message!(CopyInResponse, b'G', "`G` — the server is ready to receive copy data.");
copy_message!(CopyOutResponse, b'H', "`H` — the server is about to send copy data.");
copy_message!(CopyBothResponse, b'W', "`W` — used only by logical replication streaming.");

/// `d` — one chunk of a copy-in/copy-out data stream.
#[derive(Debug, Clone)]
pub struct CopyData {
    pub data: Bytes,
}

impl Encode for CopyData {
    const MSGTYPE: u8 = b'd';

    fn size_hint(&self) -> u32 {
        self.data.len().to_u32()
    }

    fn encode(self, buf: &mut BytesMut) {
        buf.put_slice(&self.data);
    }
}

/// `f` — the frontend is aborting a copy-in stream with an explanatory message.
#[derive(Debug, Clone)]
pub struct CopyFail {
    pub message: ByteStr,
}

impl Encode for CopyFail {
    const MSGTYPE: u8 = b'f';

    fn size_hint(&self) -> u32 {
        self.message.nul_string_len()
    }

    fn encode(self, buf: &mut BytesMut) {
        buf.put_nul_string(&self.message);
    }
}

/// Enumerates every message this server may emit, for callers that need a
/// single type to collect a response burst in (e.g. tests).
#[derive(Debug, Clone)]
pub enum BackendMessage {
    Authentication(Authentication),
    ParameterStatus(ParameterStatus),
    BackendKeyData(BackendKeyData),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
    DataRow(DataRow),
    CommandComplete(CommandComplete),
    EmptyQueryResponse(EmptyQueryResponse),
    ErrorResponse(ErrorResponse),
    NoticeResponse(NoticeResponse),
    ParseComplete(ParseComplete),
    BindComplete(BindComplete),
    CloseComplete(CloseComplete),
    NoData(NoData),
    PortalSuspended(PortalSuspended),
    ParameterDescription(ParameterDescription),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::write_frame;

    fn encoded<E: Encode>(msg: E) -> BytesMut {
        let mut buf = BytesMut::new();
        write_frame(msg, &mut buf);
        buf
    }

    #[test]
    fn ready_for_query_is_five_bytes() {
        let buf = encoded(ReadyForQuery { status: TransactionStatus::Idle });
        assert_eq!(&buf[..], &[b'Z', 0, 0, 0, 5, b'I']);
    }

    #[test]
    fn authentication_ok_has_subtype_zero() {
        let buf = encoded(Authentication::Ok);
        assert_eq!(&buf[..], &[b'R', 0, 0, 0, 8, 0, 0, 0, 0]);
    }

    #[test]
    fn command_complete_is_nul_terminated_cstr() {
        let buf = encoded(CommandComplete::new("SELECT 1"));
        assert_eq!(&buf[5..], b"SELECT 1\0");
    }

    #[test]
    fn error_response_terminates_field_list_with_nul() {
        let buf = encoded(ErrorResponse::new("08P01", "bad frame", true));
        assert_eq!(*buf.last().unwrap(), 0);
        assert!(buf.windows(5).any(|w| w == b"08P01"));
    }

    #[test]
    fn data_row_encodes_null_as_negative_one_length() {
        let buf = encoded(DataRow { values: vec![None, Some(Bytes::from_static(b"hi"))] });
        assert_eq!(i16::from_be_bytes([buf[5], buf[6]]), 2);
        assert_eq!(i32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]), -1);
        assert_eq!(i32::from_be_bytes([buf[11], buf[12], buf[13], buf[14]]), 2);
        assert_eq!(&buf[15..17], b"hi");
    }

    #[test]
    fn row_description_field_count_matches() {
        let row = RowDescription {
            fields: vec![FieldDescription::text("id"), FieldDescription::text("name")],
        };
        let buf = encoded(row);
        let count = i16::from_be_bytes([buf[5], buf[6]]);
        assert_eq!(count, 2);
    }
}
