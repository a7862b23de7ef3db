//! Accepts connections and drives each session's read → dispatch → write
//! turn to completion before the task yields, matching the single-threaded
//! cooperative scheduling model: a session's handler never runs concurrently
//! with itself, and response frames within one turn are never interleaved
//! with another session's.
//!
//! The live-session table is the only state shared across session tasks; it
//! is written only here (on accept and on session death), and mutated
//! elsewhere solely through an `AtomicBool` cancel flag — matching the
//! single-writer discipline for shared server state.
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Mutex,
    time::{Duration, timeout},
};

use crate::{
    common::{span, verbose},
    config::ServerConfig,
    dispatcher,
    error::{Error, ErrorKind, HandlerError, ProtocolError, Result},
    handler::{Handler, HandlerResult, StartupDecision},
    message::{
        backend::{Authentication, BackendKeyData, ErrorResponse, ParameterStatus, ReadyForQuery, TransactionStatus},
        frontend::StartupPacket,
    },
    session::{Session, SessionState},
};

type CancelFlag = Arc<AtomicBool>;
type LiveSessions = Arc<Mutex<HashMap<(u32, u32), CancelFlag>>>;

/// Builds a fresh [`Handler`] for each accepted connection.
///
/// Implemented for any `Fn() -> Box<dyn Handler>` closure, so most callers
/// never need to name this trait. A factory backed by a fallible resource
/// (a connection pool, a config reload) can implement it directly and return
/// [`HandlerError`] instead; the reactor logs it and drops the connection,
/// the same way it handles an `accept` failure (§4.4).
pub trait HandlerFactory: Send + Sync + 'static {
    fn build(&self) -> std::result::Result<Box<dyn Handler>, HandlerError>;
}

impl<F> HandlerFactory for F
where
    F: Fn() -> Box<dyn Handler> + Send + Sync + 'static,
{
    fn build(&self) -> std::result::Result<Box<dyn Handler>, HandlerError> {
        Ok((self)())
    }
}

/// Run the server until `shutdown` resolves (e.g. `tokio::signal::ctrl_c()`),
/// or forever if you pass `std::future::pending()`.
pub async fn serve(
    config: ServerConfig,
    factory: impl HandlerFactory,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let addr = config.socket_addr()?;
    let listener = TcpListener::bind(addr).await.map_err(Error::from)?;
    serve_listener(listener, config, factory, shutdown).await
}

/// As [`serve`], but against an already-bound listener. Lets a caller bind
/// to an OS-assigned port (`:0`) and read it back via
/// [`TcpListener::local_addr`] before the accept loop starts — most useful
/// for tests that need a collision-free port.
pub async fn serve_listener(
    listener: TcpListener,
    config: ServerConfig,
    factory: impl HandlerFactory,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    verbose!(addr = ?listener.local_addr(), "listening");

    let live: LiveSessions = Arc::new(Mutex::new(HashMap::new()));
    let next_pid = Arc::new(AtomicU32::new(1));
    let factory = Arc::new(factory);

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                verbose!("shutdown signal received");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        verbose!(error = %e, "accept failed");
                        continue;
                    }
                };

                if live.lock().await.len() >= config.max_connections {
                    verbose!(%peer, "connection cap reached, dropping");
                    drop(socket);
                    continue;
                }

                let handler = match factory.build() {
                    Ok(handler) => handler,
                    Err(err) => {
                        verbose!(%peer, error = %err, "handler construction failed, dropping connection");
                        drop(socket);
                        continue;
                    }
                };

                let pid = next_pid.fetch_add(1, Ordering::Relaxed);
                let secret_key: u32 = rand::random();
                let cancel_flag: CancelFlag = Arc::new(AtomicBool::new(false));
                live.lock().await.insert((pid, secret_key), cancel_flag.clone());
                verbose!(pid, %peer, "accepted");

                let config = config.clone();
                let live = live.clone();

                tokio::spawn(async move {
                    run_session(socket, peer, pid, secret_key, cancel_flag, config, handler, live).await;
                });
            }
        }
    }
}

/// Removes `key` from the live-session table when dropped, so a session's
/// (pid, secret) cannot be cancelled once it is gone, regardless of which
/// exit path ended the task.
struct SessionGuard {
    live: LiveSessions,
    key: (u32, u32),
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let live = self.live.clone();
        let key = self.key;
        tokio::spawn(async move {
            live.lock().await.remove(&key);
        });
    }
}

async fn run_session(
    mut socket: TcpStream,
    peer: SocketAddr,
    pid: u32,
    secret_key: u32,
    cancel_flag: CancelFlag,
    config: ServerConfig,
    mut handler: Box<dyn Handler>,
    live: LiveSessions,
) {
    span!("session", pid, %peer);
    let _guard = SessionGuard { live: live.clone(), key: (pid, secret_key) };
    let mut session = Session::new(pid, secret_key, config.max_frame_len);

    let startup_budget = Duration::from_secs(config.startup_timeout_secs);

    match timeout(startup_budget, handshake(&mut socket, &mut session, &mut *handler, &live)).await {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) => {
            let _ = flush(&mut socket, &mut session).await;
            verbose!(pid, "session closed during startup");
            return;
        }
        Ok(Err(_)) | Err(_) => {
            let _ = flush(&mut socket, &mut session).await;
            verbose!(pid, "session closed: startup failed or timed out");
            return;
        }
    }

    if flush(&mut socket, &mut session).await.is_err() {
        verbose!(pid, "session closed: write failed after startup");
        return;
    }

    loop {
        if cancel_flag.swap(false, Ordering::Relaxed) {
            session.cancel_requested = true;
            verbose!(pid, "cancel request observed");
        }

        let idle_budget = config.idle_timeout_secs.map(Duration::from_secs);
        let read_result = match idle_budget {
            Some(budget) => match timeout(budget, read_frame(&mut socket, &mut session)).await {
                Ok(r) => r,
                Err(_) => break,
            },
            None => read_frame(&mut socket, &mut session).await,
        };

        let (msgtype, body) = match read_result {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                if let ErrorKind::Protocol(protocol_err) = err.kind() {
                    send_error(&mut session, protocol_err);
                    let _ = flush(&mut socket, &mut session).await;
                }
                break;
            }
        };

        let result = dispatcher::dispatch(&mut *handler, &mut session, msgtype, body);

        if session.codec.write_buf().len() > config.write_high_water_mark {
            session.closing = true;
        }

        if flush(&mut socket, &mut session).await.is_err() {
            break;
        }

        if result == HandlerResult::FatalSession || session.closing {
            break;
        }
    }

    verbose!(pid, "session closed");
}

/// Drive the session through `AwaitStartup` (and any number of `SSLRequest`/
/// `GSSENCRequest` round-trips) to `Ready`. Returns `Ok(false)` when the
/// connection should close with no further action (terminate, cancel
/// request, rejected startup); `Err` on a transport or protocol failure.
async fn handshake(
    socket: &mut TcpStream,
    session: &mut Session,
    handler: &mut dyn Handler,
    live: &LiveSessions,
) -> Result<bool> {
    loop {
        let body = match read_startup_frame(socket, session).await {
            Ok(Some(body)) => body,
            Ok(None) => return Ok(false),
            Err(err) => {
                if let ErrorKind::Protocol(protocol_err) = err.kind() {
                    send_error(session, protocol_err);
                }
                return Ok(false);
            }
        };

        let packet = match StartupPacket::decode(body) {
            Ok(packet) => packet,
            Err(err) => {
                send_error(session, &err);
                return Ok(false);
            }
        };

        match packet {
            StartupPacket::SslRequest | StartupPacket::GssEncRequest => {
                // Core never performs the TLS/GSS handshake itself; the
                // handler decides the reply (`N` by default) and whether to
                // keep the connection open for a plaintext startup retry.
                let result = handler.ssl_request(session);
                flush(socket, session).await?;
                if result == HandlerResult::FatalSession {
                    return Ok(false);
                }
            }
            StartupPacket::CancelRequest(cancel) => {
                let found = live.lock().await.get(&(cancel.pid, cancel.secret_key)).inspect(|flag| {
                    flag.store(true, Ordering::Relaxed);
                }).is_some();
                verbose!(target_pid = cancel.pid, found, "cancel request received");
                handler.cancel(session, cancel.pid, cancel.secret_key);
                return Ok(false);
            }
            StartupPacket::Startup(startup) => {
                let Some(user) = startup.user() else {
                    send_error(session, &ProtocolError::missing_user());
                    return Ok(false);
                };
                let database = startup.database().unwrap_or(user).to_owned();
                let user = user.to_owned();
                session.user = Some(crate::common::ByteStr::copy_from_str(&user));
                session.database = Some(crate::common::ByteStr::copy_from_str(&database));
                session.state = SessionState::AwaitAuth;

                match handler.startup(session, &user, &database) {
                    StartupDecision::Trust => {
                        complete_authentication(session);
                        return Ok(true);
                    }
                    StartupDecision::Reject => return Ok(false),
                    StartupDecision::RequirePassword(auth) => {
                        session.codec.send(auth);
                        flush(socket, session).await?;
                        return await_password(socket, session, handler).await;
                    }
                }
            }
        }
    }
}

async fn await_password(socket: &mut TcpStream, session: &mut Session, handler: &mut dyn Handler) -> Result<bool> {
    let (msgtype, mut body) = match read_frame(socket, session).await {
        Ok(Some(frame)) => frame,
        Ok(None) => return Ok(false),
        Err(err) => {
            if let ErrorKind::Protocol(protocol_err) = err.kind() {
                send_error(session, protocol_err);
            }
            return Ok(false);
        }
    };

    if msgtype != b'p' {
        send_error(session, &ProtocolError::violation("expected PasswordMessage"));
        return Ok(false);
    }

    let password = match crate::codec::field::get_cstr(&mut body) {
        Ok(password) => password,
        Err(err) => {
            send_error(session, &err);
            return Ok(false);
        }
    };

    match handler.password(session, &password) {
        HandlerResult::Continue => {
            complete_authentication(session);
            Ok(true)
        }
        HandlerResult::FatalSession => Ok(false),
    }
}

/// Emit `AuthenticationOk`, the baseline `ParameterStatus` set, `BackendKeyData`,
/// and the entry `ReadyForQuery(Idle)`; enter `Ready`.
fn complete_authentication(session: &mut Session) {
    session.codec.send(Authentication::Ok);
    for (name, value) in [
        ("server_version", "14.0"),
        ("client_encoding", "UTF8"),
        ("server_encoding", "UTF8"),
        ("DateStyle", "ISO, MDY"),
    ] {
        session.codec.send(ParameterStatus {
            name: crate::common::ByteStr::from_static(name),
            value: crate::common::ByteStr::from_static(value),
        });
    }
    session.codec.send(BackendKeyData { pid: session.pid as i32, secret_key: session.secret_key as i32 });
    session.transaction_status = TransactionStatus::Idle;
    session.codec.send(ReadyForQuery { status: TransactionStatus::Idle });
    session.state = SessionState::Ready;
}

fn send_error(session: &mut Session, err: &ProtocolError) {
    session.codec.send(ErrorResponse::new(err.sqlstate, err.message.clone(), err.fatal));
}

/// Read bytes into the session's codec until a complete typed frame is
/// available, EOF, or a transport/protocol error.
async fn read_frame(socket: &mut TcpStream, session: &mut Session) -> Result<Option<(u8, Bytes)>> {
    loop {
        if let Some(frame) = session.codec.try_decode()? {
            return Ok(Some(frame));
        }
        session.codec.reserve_read();
        let n = socket.read_buf(session.codec.read_buf_mut()).await.map_err(Error::from)?;
        if n == 0 {
            return Ok(None);
        }
    }
}

/// As [`read_frame`], but for the untyped startup-class frame.
async fn read_startup_frame(socket: &mut TcpStream, session: &mut Session) -> Result<Option<Bytes>> {
    loop {
        if let Some(frame) = session.codec.try_decode_startup()? {
            return Ok(Some(frame));
        }
        session.codec.reserve_read();
        let n = socket.read_buf(session.codec.read_buf_mut()).await.map_err(Error::from)?;
        if n == 0 {
            return Ok(None);
        }
    }
}

async fn flush(socket: &mut TcpStream, session: &mut Session) -> Result<()> {
    if session.codec.write_buf().is_empty() {
        return Ok(());
    }
    verbose!(pid = session.pid, bytes = session.codec.write_buf().len(), "outbound frames");
    socket.write_all_buf(session.codec.write_buf_mut()).await.map_err(Error::from)?;
    socket.flush().await.map_err(Error::from)?;
    Ok(())
}
