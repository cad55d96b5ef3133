//! Redis connection pool.

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use deadpool::managed::{self, Metrics};
use redis::{Client, ErrorKind, RedisError, RedisResult, aio::MultiplexedConnection};

use config::{RedisConfig, RedisTlsConfig};

/// Redis connection pool.
pub type Pool = deadpool::managed::Pool<Manager>;

/// Manager for Redis connections.
#[derive(Debug)]
pub struct Manager {
    client: Client,
    connection_timeout: Duration,
    ping_number: AtomicUsize,
}

impl Manager {
    /// Create a new Redis pool manager.
    pub fn new(config: &RedisConfig) -> RedisResult<Self> {
        let client = match config.tls.as_ref().filter(|tls| tls.enabled) {
            Some(tls_config) => {
                let tls_certs = build_tls_certificates(tls_config)?;
                Client::build_with_tls(config.url.clone(), tls_certs)?
            }
            None => Client::open(config.url.as_str())?,
        };

        Ok(Self {
            client,
            connection_timeout: config.connection_timeout,
            ping_number: AtomicUsize::new(0),
        })
    }
}

impl managed::Manager for Manager {
    type Type = MultiplexedConnection;
    type Error = RedisError;

    async fn create(&self) -> Result<MultiplexedConnection, Self::Error> {
        let connect = self.client.get_multiplexed_async_connection();

        match tokio::time::timeout(self.connection_timeout, connect).await {
            Ok(conn) => conn,
            Err(_) => Err(RedisError::from((
                ErrorKind::IoError,
                "Timed out connecting to Redis",
                format!("no connection after {:?}", self.connection_timeout),
            ))),
        }
    }

    async fn recycle(&self, conn: &mut MultiplexedConnection, _: &Metrics) -> managed::RecycleResult<Self::Error> {
        let ping_number = self.ping_number.fetch_add(1, Ordering::Relaxed).to_string();

        let (n,) = redis::Pipeline::with_capacity(2)
            .cmd("UNWATCH")
            .ignore()
            .cmd("PING")
            .arg(&ping_number)
            .query_async::<(String,)>(conn)
            .await?;

        if n == ping_number {
            Ok(())
        } else {
            Err(managed::RecycleError::message("Invalid PING response"))
        }
    }
}

fn read_file(path: &str, description: &'static str) -> RedisResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| RedisError::from((ErrorKind::IoError, description, format!("{path}: {e}"))))
}

/// Build TLS certificates from configuration.
fn build_tls_certificates(config: &RedisTlsConfig) -> RedisResult<redis::TlsCertificates> {
    let client_tls = match (&config.client_cert_path, &config.client_key_path) {
        (Some(cert_path), Some(key_path)) => Some(redis::ClientTlsConfig {
            client_cert: read_file(cert_path, "Failed to read client certificate")?,
            client_key: read_file(key_path, "Failed to read client key")?,
        }),
        (None, None) => None,
        _ => {
            return Err(RedisError::from((
                ErrorKind::InvalidClientConfig,
                "Mutual TLS needs both client_cert_path and client_key_path",
            )));
        }
    };

    let root_cert = config
        .ca_cert_path
        .as_deref()
        .map(|path| read_file(path, "Failed to read CA certificate"))
        .transpose()?;

    Ok(redis::TlsCertificates { client_tls, root_cert })
}

/// Create a Redis connection pool from configuration.
pub fn create_pool(config: &RedisConfig) -> RedisResult<Pool> {
    let manager = Manager::new(config)?;

    let mut pool_config = deadpool::managed::PoolConfig::default();

    if let Some(max_size) = config.pool.max_size {
        pool_config.max_size = max_size;
    }

    pool_config.timeouts.create = config.pool.timeout_create;
    pool_config.timeouts.wait = config.pool.timeout_wait;
    pool_config.timeouts.recycle = config.pool.timeout_recycle;

    let pool = Pool::builder(manager)
        .config(pool_config)
        .runtime(deadpool::Runtime::Tokio1)
        .build()
        .map_err(|e| RedisError::from((ErrorKind::IoError, "Failed to create pool", e.to_string())))?;

    Ok(pool)
}
