//! Server configuration: bind address, connection limits, TLS material, log level.
use std::{env::var, net::SocketAddr, path::PathBuf};

use tracing::level_filters::LevelFilter;

use crate::{
    codec::DEFAULT_MAX_FRAME_LEN,
    error::{ConfigError, Result},
};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 5432;
const DEFAULT_MAX_CONNECTIONS: usize = 1024;
const DEFAULT_WRITE_HIGH_WATER_MARK: usize = 16 * 1024 * 1024;
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 10;

/// TLS certificate/key pair for the (out-of-scope-by-default) SSL negotiation
/// collaborator. The core only ever emits `N` unless this is set and a
/// replacement `ssl_request` handler is registered.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// A fully resolved server configuration.
///
/// Build with [`ServerConfig::from_env`] or the builder methods starting from
/// [`ServerConfig::default`].
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub max_frame_len: u32,
    pub write_high_water_mark: usize,
    pub startup_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
    pub tls: Option<TlsConfig>,
    /// Passed through to the logging collaborator; not interpreted by the core.
    pub log_level: LevelFilter,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            write_high_water_mark: DEFAULT_WRITE_HIGH_WATER_MARK,
            startup_timeout_secs: DEFAULT_STARTUP_TIMEOUT_SECS,
            idle_timeout_secs: None,
            tls: None,
            log_level: LevelFilter::INFO,
        }
    }
}

impl ServerConfig {
    /// Read configuration from the environment, falling back to defaults for
    /// anything unset:
    ///
    /// - `PGEMU_HOST`, `PGEMU_PORT`
    /// - `PGEMU_MAX_CONNECTIONS`, `PGEMU_MAX_FRAME_LEN`
    /// - `PGEMU_TLS_CERT`, `PGEMU_TLS_KEY` (both required together, or both absent)
    /// - `PGEMU_LOG`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        macro_rules! parsed_env {
            ($name:literal, $field:ident) => {
                if let Ok(raw) = var($name) {
                    config.$field = raw
                        .parse()
                        .map_err(|_| ConfigError::new(format!("{} is not a valid value: {raw:?}", $name)))?;
                }
            };
        }

        if let Ok(host) = var("PGEMU_HOST") {
            config.host = host;
        }
        parsed_env!("PGEMU_PORT", port);
        parsed_env!("PGEMU_MAX_CONNECTIONS", max_connections);
        parsed_env!("PGEMU_MAX_FRAME_LEN", max_frame_len);
        parsed_env!("PGEMU_LOG", log_level);

        let cert = var("PGEMU_TLS_CERT").ok();
        let key = var("PGEMU_TLS_KEY").ok();
        config.tls = match (cert, key) {
            (Some(cert_path), Some(key_path)) => {
                Some(TlsConfig { cert_path: cert_path.into(), key_path: key_path.into() })
            }
            (None, None) => None,
            _ => return Err(ConfigError::new("PGEMU_TLS_CERT and PGEMU_TLS_KEY must be set together").into()),
        };

        Ok(config)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: u32) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn with_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.idle_timeout_secs = Some(secs);
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// The `(host, port)` pair, parsed to a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ConfigError::new(format!("invalid bind address {}:{}", self.host, self.port)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_localhost_5432() {
        let config = ServerConfig::default();
        assert_eq!(config.socket_addr().unwrap().to_string(), "127.0.0.1:5432");
    }

    #[test]
    fn builder_methods_chain() {
        let config = ServerConfig::default().with_port(6543).with_max_connections(10);
        assert_eq!(config.port, 6543);
        assert_eq!(config.max_connections, 10);
    }
}
