//! Server-side emulator of the PostgreSQL frontend/backend wire protocol,
//! version 3.0.
//!
//! This crate carries unmodified client drivers through the startup/
//! authentication handshake and then services the simple- and extended-query
//! message cycles against application logic you provide via [`Handler`]. It
//! is not a SQL engine: statement text and bound parameters are handed to
//! your handler as opaque bytes, and what comes back over the wire is
//! whatever response frames your handler queues.
//!
//! # Example
//!
//! ```no_run
//! use pgwire_emu::{config::ServerConfig, handler::{DefaultHandler, Handler}, reactor};
//!
//! # async fn app() -> pgwire_emu::Result<()> {
//! let config = ServerConfig::default().with_port(5433);
//! let factory = || Box::new(DefaultHandler) as Box<dyn Handler>;
//! reactor::serve(config, factory, std::future::pending()).await?;
//! # Ok(())
//! # }
//! ```
pub mod common;
mod ext;

pub mod codec;
pub mod message;

pub mod session;
pub mod handler;
pub mod dispatcher;
pub mod response;
pub mod reactor;
pub mod config;

mod error;

pub use error::{Error, ErrorKind, Result};
pub use handler::{Handler, HandlerResult, StartupDecision};
pub use session::Session;
