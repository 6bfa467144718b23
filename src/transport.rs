//! Network I/O primitive consumed by the measurement engine.
//!
//! The engine never talks to sockets directly. Everything goes through the
//! [`Transport`] trait so that tests can script network behavior and so the
//! HTTP endpoint layout stays in one place.

use crate::{Error, Result};
use futures::future::BoxFuture;
use futures::StreamExt;
use log::debug;
use reqwest::Url;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Size of each chunk pushed through an upload body.
pub const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Body size fetched by the resource-load latency probe.
pub const RESOURCE_PROBE_BYTES: u64 = 1_000;

/// Shared byte counter that transfers add to as data moves.
///
/// Cloning shares the same underlying counter.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter {
    bytes: Arc<AtomicU64>,
}

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Asynchronous network operations the measurement engine needs.
///
/// Timing primitives return the measured round trip; transfer primitives
/// report progress through the supplied [`ByteCounter`] as bytes arrive or
/// leave, and stop early (returning the bytes moved so far) once `cancel`
/// fires.
pub trait Transport: Send + Sync {
    /// Human-readable endpoint identifier used in logs.
    fn endpoint(&self) -> String;

    /// Times a minimal request/response exchange.
    fn request_rtt(&self, timeout: Duration) -> BoxFuture<'_, Result<Duration>>;

    /// Times loading a small resource end to end, body included.
    fn resource_load(&self, timeout: Duration) -> BoxFuture<'_, Result<Duration>>;

    /// Times establishing a connection to the endpoint.
    fn handshake(&self, timeout: Duration) -> BoxFuture<'_, Result<Duration>>;

    /// Downloads `bytes` bytes.
    fn download(
        &self,
        bytes: u64,
        counter: ByteCounter,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<u64>>;

    /// Uploads `bytes` bytes.
    fn upload(
        &self,
        bytes: u64,
        counter: ByteCounter,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<u64>>;
}

/// HTTP transport against a speed-test style endpoint exposing
/// `GET /__down?bytes=N` and `POST /__up`.
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
}

impl HttpTransport {
    /// Creates a transport for the given base URL.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the URL cannot be parsed or has no
    /// host, and an HTTP error if the client cannot be built.
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid server url '{}': {}", base_url, e)))?;
        if base.host_str().is_none() {
            return Err(Error::Config(format!("server url '{}' has no host", base_url)));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("netpulse/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, base })
    }

    fn down_url(&self, bytes: u64) -> Result<Url> {
        let mut url = self
            .base
            .join("__down")
            .map_err(|e| Error::Config(format!("invalid download route: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("bytes", &bytes.to_string())
            .append_pair("r", &rand::random::<u32>().to_string());
        Ok(url)
    }

    fn up_url(&self) -> Result<Url> {
        self.base
            .join("__up")
            .map_err(|e| Error::Config(format!("invalid upload route: {}", e)))
    }
}

impl Transport for HttpTransport {
    fn endpoint(&self) -> String {
        self.base.to_string()
    }

    fn request_rtt(&self, timeout: Duration) -> BoxFuture<'_, Result<Duration>> {
        Box::pin(async move {
            let url = self.down_url(0)?;
            let start = Instant::now();
            self.client
                .get(url)
                .timeout(timeout)
                .send()
                .await?
                .error_for_status()?;
            Ok(start.elapsed())
        })
    }

    fn resource_load(&self, timeout: Duration) -> BoxFuture<'_, Result<Duration>> {
        Box::pin(async move {
            let url = self.down_url(RESOURCE_PROBE_BYTES)?;
            let start = Instant::now();
            let body = self
                .client
                .get(url)
                .timeout(timeout)
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;
            debug!("Resource probe loaded {} bytes", body.len());
            Ok(start.elapsed())
        })
    }

    fn handshake(&self, timeout: Duration) -> BoxFuture<'_, Result<Duration>> {
        Box::pin(async move {
            let host = self
                .base
                .host_str()
                .ok_or_else(|| Error::Config("server url has no host".to_string()))?;
            let port = self.base.port_or_known_default().unwrap_or(443);

            let addr = tokio::net::lookup_host((host, port))
                .await?
                .next()
                .ok_or_else(|| Error::Connectivity(format!("{} did not resolve", host)))?;

            let start = Instant::now();
            let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| Error::Connectivity(format!("connect to {} timed out", addr)))??;
            let elapsed = start.elapsed();
            drop(stream);
            Ok(elapsed)
        })
    }

    fn download(
        &self,
        bytes: u64,
        counter: ByteCounter,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let url = self.down_url(bytes)?;
            let response = tokio::select! {
                _ = cancel.cancelled() => return Ok(0),
                response = self.client.get(url).send() => response?.error_for_status()?,
            };

            let mut body = response.bytes_stream();
            let mut received = 0u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = body.next() => match chunk {
                        Some(Ok(chunk)) => {
                            received += chunk.len() as u64;
                            counter.add(chunk.len() as u64);
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => break,
                    },
                }
            }
            Ok(received)
        })
    }

    fn upload(
        &self,
        bytes: u64,
        counter: ByteCounter,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let url = self.up_url()?;
            let sent = ByteCounter::new();
            let body_counter = sent.clone();
            let body_cancel = cancel.clone();

            // Bytes are counted as each chunk is handed to the connection.
            let chunks = futures::stream::unfold(0u64, move |offset| {
                let counter = counter.clone();
                let body_counter = body_counter.clone();
                let cancel = body_cancel.clone();
                async move {
                    if offset >= bytes || cancel.is_cancelled() {
                        return None;
                    }
                    let len = (bytes - offset).min(UPLOAD_CHUNK_SIZE as u64);
                    counter.add(len);
                    body_counter.add(len);
                    Some((Ok::<_, std::io::Error>(vec![0u8; len as usize]), offset + len))
                }
            });

            let request = self
                .client
                .post(url)
                .body(reqwest::Body::wrap_stream(chunks))
                .send();

            tokio::select! {
                _ = cancel.cancelled() => {}
                response = request => {
                    response?.error_for_status()?;
                }
            }
            Ok(sent.get())
        })
    }
}
