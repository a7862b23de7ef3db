//! Messages a client sends to this server.
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>
use bytes::Bytes;

use crate::{
    codec::field,
    common::ByteStr,
    error::ProtocolError,
};

/// Protocol version 3.0, `Int32(196608)`.
pub const PROTOCOL_VERSION_3_0: u32 = 0x0003_0000;
/// `CancelRequest` magic code, in place of a protocol version.
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;
/// `SSLRequest` magic code.
pub const SSL_REQUEST_CODE: u32 = 80_877_103;
/// `GSSENCRequest` magic code.
pub const GSS_ENC_REQUEST_CODE: u32 = 80_877_104;

/// A type that can be decoded from a client wire message.
pub trait Decode: Sized {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError>;
}

macro_rules! msgtype {
    ($me:ident, $ty:literal) => {
        impl $me {
            #[doc = concat!("`", stringify!($ty), "`")]
            pub const MSGTYPE: u8 = $ty;
        }
    };
}

/// Any of the messages the startup/authentication phase may receive as the
/// connection's very first, untyped frame.
#[derive(Debug)]
pub enum StartupPacket {
    Startup(StartupMessage),
    CancelRequest(CancelRequest),
    SslRequest,
    GssEncRequest,
}

impl StartupPacket {
    /// Decode the leading `Int32` as either a protocol version or one of the
    /// three magic request codes, then decode the rest accordingly.
    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        let code = field::get_u32(&mut body)?;

        match code {
            CANCEL_REQUEST_CODE => Ok(Self::CancelRequest(CancelRequest::decode_body(body)?)),
            SSL_REQUEST_CODE => Ok(Self::SslRequest),
            GSS_ENC_REQUEST_CODE => Ok(Self::GssEncRequest),
            version if version >> 16 == 3 => Ok(Self::Startup(StartupMessage::decode_body(version, body)?)),
            other => Err(ProtocolError::violation(format!("unsupported startup code {other}"))),
        }
    }
}

/// The startup message: protocol version plus `name=value` run-time parameters.
#[derive(Debug)]
pub struct StartupMessage {
    pub version: u32,
    pub params: Vec<(ByteStr, ByteStr)>,
}

impl StartupMessage {
    fn decode_body(version: u32, mut body: Bytes) -> Result<Self, ProtocolError> {
        let mut params = Vec::new();

        loop {
            if body.is_empty() {
                return Err(ProtocolError::violation("startup message missing terminator"));
            }
            if body[0] == 0 {
                let _ = field::get_u8(&mut body)?;
                break;
            }
            let key = field::get_cstr(&mut body)?;
            let value = field::get_cstr(&mut body)?;
            params.push((key, value));
        }

        Ok(Self { version, params })
    }

    /// The required `user` parameter, if present.
    pub fn user(&self) -> Option<&str> {
        self.param("user")
    }

    /// The `database` parameter, defaulting to `user` per §4.2.
    pub fn database(&self) -> Option<&str> {
        self.param("database").or_else(|| self.user())
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k.as_ref() == key).map(|(_, v)| v.as_ref())
    }
}

/// Cancel the session identified by `(pid, secret_key)`, sent on a separate connection.
#[derive(Debug, Clone, Copy)]
pub struct CancelRequest {
    pub pid: u32,
    pub secret_key: u32,
}

impl CancelRequest {
    fn decode_body(mut body: Bytes) -> Result<Self, ProtocolError> {
        Ok(Self { pid: field::get_u32(&mut body)?, secret_key: field::get_u32(&mut body)? })
    }
}

/// Any message legal in `Ready` / `InExtended` / `AwaitAuth`, after the startup handshake.
#[derive(Debug)]
pub enum FrontendMessage {
    Password(PasswordMessage),
    Query(Query),
    Parse(Parse),
    Bind(Bind),
    Describe(Describe),
    Execute(Execute),
    Close(Close),
    Sync,
    Flush,
    Terminate,
    /// A message type the core does not recognize; preserved so the
    /// dispatcher's `unknown` slot can still respond appropriately.
    Unknown(u8, Bytes),
}

impl FrontendMessage {
    pub fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        let msg = match msgtype {
            PasswordMessage::MSGTYPE => Self::Password(PasswordMessage::decode(msgtype, body)?),
            Query::MSGTYPE => Self::Query(Query::decode(msgtype, body)?),
            Parse::MSGTYPE => Self::Parse(Parse::decode(msgtype, body)?),
            Bind::MSGTYPE => Self::Bind(Bind::decode(msgtype, body)?),
            Describe::MSGTYPE => Self::Describe(Describe::decode(msgtype, body)?),
            Execute::MSGTYPE => Self::Execute(Execute::decode(msgtype, body)?),
            Close::MSGTYPE => Self::Close(Close::decode(msgtype, body)?),
            b'S' => Self::Sync,
            b'H' => Self::Flush,
            b'X' => Self::Terminate,
            other => Self::Unknown(other, body),
        };
        Ok(msg)
    }

    /// Whether this message belongs to the extended-query burst (anything
    /// other than `Query`), per §4.2.
    pub fn is_extended_query(&self) -> bool {
        matches!(
            self,
            Self::Parse(_) | Self::Bind(_) | Self::Describe(_) | Self::Execute(_) | Self::Close(_)
        )
    }
}

/// `p` — a cleartext or hashed password response to an `AuthenticationRequest`.
#[derive(Debug)]
pub struct PasswordMessage {
    pub password: ByteStr,
}

msgtype!(PasswordMessage, b'p');

impl Decode for PasswordMessage {
    fn decode(_msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        Ok(Self { password: field::get_cstr(&mut body)? })
    }
}

/// `Q` — a simple-query cycle request.
#[derive(Debug)]
pub struct Query {
    pub sql: ByteStr,
}

msgtype!(Query, b'Q');

impl Decode for Query {
    fn decode(_msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        Ok(Self { sql: field::get_cstr(&mut body)? })
    }
}

/// `P` — parse a query into a named (or unnamed) prepared statement.
#[derive(Debug)]
pub struct Parse {
    pub statement: ByteStr,
    pub sql: ByteStr,
    pub param_oids: Vec<u32>,
}

msgtype!(Parse, b'P');

impl Decode for Parse {
    fn decode(_msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        let statement = field::get_cstr(&mut body)?;
        let sql = field::get_cstr(&mut body)?;
        let param_oids = field::get_array(&mut body, field::get_u32)?;
        Ok(Self { statement, sql, param_oids })
    }
}

/// The value of one bound parameter: `None` denotes SQL `NULL` (wire length `-1`).
pub type BindParamValue = Option<Bytes>;

/// `B` — bind a statement to a (possibly new) portal with concrete parameter values.
#[derive(Debug)]
pub struct Bind {
    pub portal: ByteStr,
    pub statement: ByteStr,
    pub param_formats: Vec<i16>,
    pub params: Vec<BindParamValue>,
    pub result_formats: Vec<i16>,
}

msgtype!(Bind, b'B');

impl Decode for Bind {
    fn decode(_msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        let portal = field::get_cstr(&mut body)?;
        let statement = field::get_cstr(&mut body)?;
        let param_formats = field::get_array(&mut body, field::get_i16)?;

        let params = field::get_array(&mut body, |buf| {
            let len = field::get_i32(buf)?;
            if len < 0 {
                return Ok(None);
            }
            Ok(Some(field::get_byten(buf, len as usize)?))
        })?;

        let result_formats = field::get_array(&mut body, field::get_i16)?;

        Ok(Self { portal, statement, param_formats, params, result_formats })
    }
}

/// Which kind of named object a `Describe`/`Close` message targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescribeTarget {
    Statement,
    Portal,
}

impl DescribeTarget {
    fn decode(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            b'S' => Ok(Self::Statement),
            b'P' => Ok(Self::Portal),
            other => Err(ProtocolError::violation(format!("invalid describe/close target {other:?}"))),
        }
    }
}

/// `D` — request the parameter/row description of a statement or portal.
#[derive(Debug)]
pub struct Describe {
    pub target: DescribeTarget,
    pub name: ByteStr,
}

msgtype!(Describe, b'D');

impl Decode for Describe {
    fn decode(_msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        let target = DescribeTarget::decode(field::get_u8(&mut body)?)?;
        let name = field::get_cstr(&mut body)?;
        Ok(Self { target, name })
    }
}

/// `E` — execute a portal, retrieving up to `max_rows` rows (`0` = unlimited).
#[derive(Debug)]
pub struct Execute {
    pub portal: ByteStr,
    pub max_rows: i32,
}

msgtype!(Execute, b'E');

impl Decode for Execute {
    fn decode(_msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        let portal = field::get_cstr(&mut body)?;
        let max_rows = field::get_i32(&mut body)?;
        Ok(Self { portal, max_rows })
    }
}

/// `C` — close a named statement or portal.
#[derive(Debug)]
pub struct Close {
    pub target: DescribeTarget,
    pub name: ByteStr,
}

msgtype!(Close, b'C');

impl Decode for Close {
    fn decode(_msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        let target = DescribeTarget::decode(field::get_u8(&mut body)?)?;
        let name = field::get_cstr(&mut body)?;
        Ok(Self { target, name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cstr(s: &str) -> Vec<u8> {
        let mut v = s.as_bytes().to_vec();
        v.push(0);
        v
    }

    #[test]
    fn startup_message_parses_params_and_defaults_database() {
        let mut body = Vec::new();
        body.extend(cstr("user"));
        body.extend(cstr("alice"));
        body.push(0);
        let packet = StartupPacket::decode({
            let mut full = PROTOCOL_VERSION_3_0.to_be_bytes().to_vec();
            full.extend(body);
            Bytes::from(full)
        })
        .unwrap();
        match packet {
            StartupPacket::Startup(msg) => {
                assert_eq!(msg.user(), Some("alice"));
                assert_eq!(msg.database(), Some("alice"));
            }
            other => panic!("expected Startup, got {other:?}"),
        }
    }

    #[test]
    fn cancel_request_decodes_pid_and_secret() {
        let mut full = CANCEL_REQUEST_CODE.to_be_bytes().to_vec();
        full.extend(42u32.to_be_bytes());
        full.extend(777u32.to_be_bytes());
        match StartupPacket::decode(Bytes::from(full)).unwrap() {
            StartupPacket::CancelRequest(c) => {
                assert_eq!(c.pid, 42);
                assert_eq!(c.secret_key, 777);
            }
            other => panic!("expected CancelRequest, got {other:?}"),
        }
    }

    #[test]
    fn unknown_startup_magic_is_a_violation() {
        let body = Bytes::from(0x1234_5678u32.to_be_bytes().to_vec());
        let err = StartupPacket::decode(body).unwrap_err();
        assert_eq!(err.sqlstate, "08P01");
    }

    #[test]
    fn bind_decodes_null_and_present_params() {
        let mut body = Vec::new();
        body.extend(cstr(""));
        body.extend(cstr("s"));
        body.extend(0i16.to_be_bytes()); // param format count
        body.extend(2i16.to_be_bytes()); // param count
        body.extend((-1i32).to_be_bytes()); // NULL
        body.extend(3i32.to_be_bytes());
        body.extend(b"420");
        body.extend(0i16.to_be_bytes()); // result format count

        let bind = Bind::decode(b'B', Bytes::from(body)).unwrap();
        assert_eq!(bind.params.len(), 2);
        assert!(bind.params[0].is_none());
        assert_eq!(bind.params[1].as_deref(), Some(&b"420"[..]));
    }

    #[test]
    fn describe_rejects_invalid_target_byte() {
        let mut body = Vec::new();
        body.push(b'Q');
        body.extend(cstr("s"));
        let err = Describe::decode(b'D', Bytes::from(body)).unwrap_err();
        assert_eq!(err.sqlstate, "08P01");
    }

    #[test]
    fn unrecognized_message_type_is_preserved_not_rejected() {
        let msg = FrontendMessage::decode(b'?', Bytes::from_static(b"junk")).unwrap();
        assert!(matches!(msg, FrontendMessage::Unknown(b'?', _)));
    }
}
