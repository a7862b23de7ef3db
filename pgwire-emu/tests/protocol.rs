//! End-to-end coverage over real TCP sockets: the startup/auth handshake,
//! the simple- and extended-query cycles, the cancel side-channel and
//! `Terminate`, plus a raw-bytes check of the oversized-frame guard.
use std::{net::SocketAddr, time::Duration};

use pgwire_emu::{
    Handler, HandlerResult,
    config::ServerConfig,
    handler::DefaultHandler,
    message::frontend::Parse,
    reactor::{self, HandlerFactory},
    response,
    session::Session,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_postgres::NoTls;

/// Bind an OS-assigned port, start the reactor against it, and return the
/// bound address. The server task is tied to the current test's runtime and
/// is dropped along with it.
async fn spawn(factory: impl HandlerFactory) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig::default();
    tokio::spawn(reactor::serve_listener(listener, config, factory, std::future::pending()));
    addr
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let connstr = format!("host={} port={} user=test dbname=test", addr.ip(), addr.port());
    let (client, connection) = tokio_postgres::connect(&connstr, NoTls).await.expect("failed to connect");
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

/// Answers `SELECT 1` in the simple-query cycle with a one-row result;
/// anything else is an empty `SELECT 0`.
struct EchoHandler;

impl Handler for EchoHandler {
    fn query(&mut self, session: &mut Session, sql: &str) -> HandlerResult {
        let sql = sql.trim().trim_end_matches(';');
        if sql.eq_ignore_ascii_case("select 1") {
            let fields = vec![pgwire_emu::message::backend::FieldDescription::text("?column?")];
            let rows = vec![vec![Some(bytes::Bytes::from_static(b"1"))]];
            response::send_result_set(session, fields, rows, response::command_tag("SELECT", 1));
        } else {
            response::send_result_set(session, vec![], vec![], response::command_tag("SELECT", 0));
        }
        HandlerResult::Continue
    }
}

/// Fails `Parse` for any statement text containing `"nope"`, to exercise the
/// `ErrorExtended` recovery path; every other statement behaves like the
/// trait default.
struct FlakyParseHandler;

impl Handler for FlakyParseHandler {
    fn parse(&mut self, session: &mut Session, parse: &Parse) -> HandlerResult {
        if parse.sql.contains("nope") {
            response::send_application_error(session, "42601", "deliberately rejected");
            return HandlerResult::FatalSession;
        }
        session.statements.insert(parse.statement.clone(), pgwire_emu::session::Statement::from_parse(parse));
        session.codec.send(pgwire_emu::message::backend::ParseComplete);
        HandlerResult::Continue
    }
}

async fn read_available(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match timeout(Duration::from_millis(200), stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) => break,
        }
    }
    buf
}

#[tokio::test]
async fn happy_startup_and_simple_query() {
    let addr = spawn(|| Box::new(EchoHandler) as Box<dyn Handler>).await;
    let client = connect(addr).await;

    let messages = client.simple_query("SELECT 1").await.unwrap();
    let rows: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            tokio_postgres::SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(rows.len(), 1);
    let value: &str = rows[0].get(0).unwrap();
    assert_eq!(value, "1");
}

#[tokio::test]
async fn oversized_startup_frame_is_rejected_and_connection_closed() {
    let addr = spawn(|| Box::new(DefaultHandler) as Box<dyn Handler>).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // An untyped startup-class frame claiming a length far past any
    // configured maximum.
    stream.write_all(&0xFFFF_FFFFu32.to_be_bytes()).await.unwrap();
    stream.flush().await.unwrap();

    let resp = read_available(&mut stream).await;
    assert!(!resp.is_empty());
    assert_eq!(resp[0], b'E', "expected an ErrorResponse frame, got {:?}", resp.first());

    let mut tail = [0u8; 1];
    let n = stream.read(&mut tail).await.unwrap_or(0);
    assert_eq!(n, 0, "connection should be closed after a frame-length violation");
}

#[tokio::test]
async fn extended_query_burst_completes_with_default_handler() {
    let addr = spawn(|| Box::new(DefaultHandler) as Box<dyn Handler>).await;
    let client = connect(addr).await;

    // `.query()` drives Parse/Bind/Describe/Execute/Sync. The default
    // handler's `Describe` sends `NoData`, so no rows come back, but the
    // pipeline must complete without error.
    let rows = client.query("SELECT 1", &[]).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn error_mid_burst_recovers_after_sync() {
    let addr = spawn(|| Box::new(FlakyParseHandler) as Box<dyn Handler>).await;
    let client = connect(addr).await;

    let err = client.query("SELECT 'nope'", &[]).await.unwrap_err();
    assert!(err.code().is_some(), "failed parse should surface a SQLSTATE");

    // The connection recovers at the next Sync; a following statement that
    // does not trip the handler's failure condition succeeds.
    let rows = client.query("SELECT 1", &[]).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn cancel_request_interrupts_the_next_query() {
    let addr = spawn(|| Box::new(DefaultHandler) as Box<dyn Handler>).await;
    let client = connect(addr).await;
    let cancel_token = client.cancel_token();

    cancel_token.cancel_query(NoTls).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = client.simple_query("SELECT 1").await.unwrap_err();
    let msg = err.to_string();
    assert!(
        err.code().map(|c| c.code() == "57014").unwrap_or(false) || msg.to_lowercase().contains("cancel"),
        "expected a query_canceled error, got: {msg}"
    );
}

#[tokio::test]
async fn terminate_elicits_no_response_and_closes() {
    let addr = spawn(|| Box::new(DefaultHandler) as Box<dyn Handler>).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut body = Vec::new();
    body.extend_from_slice(&196_608u32.to_be_bytes()); // protocol 3.0
    body.extend_from_slice(b"user\0");
    body.extend_from_slice(b"test\0");
    body.push(0);
    let mut frame = Vec::new();
    frame.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    stream.write_all(&frame).await.unwrap();
    stream.flush().await.unwrap();

    let handshake_reply = read_available(&mut stream).await;
    assert_eq!(handshake_reply[0], b'R', "expected AuthenticationOk to start the handshake reply");

    // Terminate: type byte 'X', length 4 (no body).
    stream.write_all(&[b'X', 0, 0, 0, 4]).await.unwrap();
    stream.flush().await.unwrap();

    let after_terminate = read_available(&mut stream).await;
    assert!(after_terminate.is_empty(), "Terminate must not produce a reply");

    let mut tail = [0u8; 1];
    let n = stream.read(&mut tail).await.unwrap_or(0);
    assert_eq!(n, 0, "connection should be closed after Terminate");
}
