//! Framed request/response channel to a single broker
//!
//! A channel owns at most one TCP connection, opened lazily on first use and
//! dropped after any fatal I/O error so the next operation reconnects. Every
//! request is `int32 size | payload`; every response is `int32 size | header |
//! body` where the header is protocol specific (an error code in 0.7, a
//! correlation id in 0.8).
//!
//! Only one request may be in flight. A response must be drained, either by
//! reading it to the end or through [`Channel::flush_response`], before the
//! next request can be sent.

pub mod consumer;
pub mod producer;

pub use consumer::ConsumerChannel;
pub use producer::ProducerChannel;

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::KafkaClientError;
use crate::metrics::ClientMetrics;
use crate::protocol::ProtocolCodec;
use crate::Result;

const SIZE_LEN: usize = 4;
/// Largest buffer used when discarding response bytes
const DRAIN_CHUNK: usize = 64 * 1024;

/// Where a channel is in its request/response cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No socket
    Idle,
    /// Connected, ready to send
    Writable,
    /// Request sent, response size not read yet
    AwaitingHeader,
    /// Response header read, `remaining` body bytes unread
    AwaitingBody { remaining: usize },
}

impl ChannelState {
    pub fn is_awaiting_response(self) -> bool {
        matches!(
            self,
            ChannelState::AwaitingHeader | ChannelState::AwaitingBody { .. }
        )
    }
}

#[derive(Debug)]
pub struct Channel {
    config: ConnectionConfig,
    codec: &'static dyn ProtocolCodec,
    socket: Option<TcpStream>,
    state: ChannelState,
    read_bytes: usize,
    metrics: Arc<ClientMetrics>,
}

impl Channel {
    pub fn new(config: ConnectionConfig, metrics: Arc<ClientMetrics>) -> Self {
        let codec = config.protocol.codec();
        Self {
            config,
            codec,
            socket: None,
            state: ChannelState::Idle,
            read_bytes: 0,
            metrics,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn codec(&self) -> &'static dyn ProtocolCodec {
        self.codec
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Bytes read from the current response since the last `has_incoming_data`
    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }

    /// Unread bytes of the current response body
    pub fn remaining_bytes(&self) -> usize {
        match self.state {
            ChannelState::AwaitingBody { remaining } => remaining,
            _ => 0,
        }
    }

    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.metrics
    }

    /// Release the socket. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!("Closed channel to {}", self.config.connection_string());
        }
        self.state = ChannelState::Idle;
    }

    async fn connect(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let address = (self.config.host.as_str(), self.config.port);
        let stream = match timeout(self.config.timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.metrics.record_connection_error();
                return Err(KafkaClientError::transport(format!(
                    "Failed to connect to {}: {}",
                    self.config.connection_string(),
                    e
                )));
            }
            Err(_) => {
                self.metrics.record_connection_error();
                return Err(KafkaClientError::timeout(self.timeout_ms()));
            }
        };
        stream.set_nodelay(true)?;
        info!("Connected to broker {}", self.config.connection_string());
        self.metrics.record_connection_created();
        self.socket = Some(stream);
        self.state = ChannelState::Writable;
        Ok(())
    }

    /// Send one framed request.
    ///
    /// Fails with `IllegalState` while a response is pending. A failed write
    /// drops the socket and is retried on a fresh connection up to the
    /// configured number of attempts.
    pub async fn send(&mut self, payload: &[u8], expects_response: bool) -> Result<()> {
        if self.state.is_awaiting_response() {
            return Err(KafkaClientError::illegal_state("Kafka channel has incoming data."));
        }

        let mut frame = BytesMut::with_capacity(SIZE_LEN + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(payload);

        let attempts = self.config.send_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.connect().await {
                Ok(()) => self.write_frame(&frame).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    self.metrics.record_request(frame.len() as u64);
                    self.state = if expects_response {
                        ChannelState::AwaitingHeader
                    } else {
                        ChannelState::Writable
                    };
                    return Ok(());
                }
                Err(e) => {
                    self.close();
                    if attempt >= attempts {
                        return Err(e);
                    }
                    self.metrics.record_send_retry();
                    warn!(
                        "Request to {} failed ({}), retry {}/{}",
                        self.config.connection_string(),
                        e,
                        attempt,
                        attempts - 1
                    );
                }
            }
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let deadline = self.config.timeout;
        let socket = self.socket_mut()?;
        with_timeout(deadline, async {
            socket.write_all(frame).await?;
            socket.flush().await
        })
        .await
        .map_err(|e| match e {
            IoFailure::Timeout => KafkaClientError::timeout(deadline.as_millis() as u64),
            IoFailure::Io(e) => KafkaClientError::transport(format!(
                "Request written partially, expected to send {} bytes: {}",
                frame.len(),
                e
            )),
        })
    }

    /// Validate channel state and read the response header if not done yet.
    ///
    /// Returns `false`, and becomes writable again, once the response body
    /// is exhausted. Returns `true` with `read_bytes` reset otherwise.
    pub async fn has_incoming_data(&mut self) -> Result<bool> {
        if self.state == ChannelState::AwaitingHeader {
            self.read_header().await?;
        }
        match self.state {
            ChannelState::AwaitingBody { remaining: 0 } => {
                self.state = ChannelState::Writable;
                Ok(false)
            }
            ChannelState::AwaitingBody { .. } => {
                self.read_bytes = 0;
                Ok(true)
            }
            _ => Err(KafkaClientError::illegal_state(
                "Request has not been sent - maybe a connection problem.",
            )),
        }
    }

    async fn read_header(&mut self) -> Result<()> {
        let size_bytes = match self.read_raw(SIZE_LEN).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_end_of_stream() => {
                return Err(KafkaClientError::end_of_stream(
                    "Could not read kafka response header.",
                ))
            }
            Err(e) => return Err(e),
        };
        let size = u32::from_be_bytes([size_bytes[0], size_bytes[1], size_bytes[2], size_bytes[3]])
            as usize;
        let header_len = self.codec.response_header_len();
        if size < header_len {
            self.close();
            return Err(KafkaClientError::corrupt_response(format!(
                "Corrupt response stream! Declared size {} is shorter than the {}-byte header",
                size, header_len
            )));
        }
        let header = self.read_raw(header_len).await?;
        self.state = ChannelState::AwaitingBody {
            remaining: size - header_len,
        };

        if let Err(e) = self.codec.check_response_header(&header) {
            warn!(
                "Response from {} rejected: {}",
                self.config.connection_string(),
                e
            );
            self.discard_body().await?;
            return Err(e);
        }
        Ok(())
    }

    /// Read exactly `size` bytes of the current response body.
    ///
    /// Asking for more than remains flushes the rest of the response and
    /// fails with `EndOfStream`; consumers treat that as "fetch again".
    pub async fn read(&mut self, size: usize) -> Result<Bytes> {
        let remaining = match self.state {
            ChannelState::AwaitingBody { remaining } => remaining,
            _ => return Err(KafkaClientError::illegal_state("Kafka channel is not readable.")),
        };
        if size > remaining {
            self.discard_body().await?;
            return Err(KafkaClientError::end_of_stream(format!(
                "Trying to read {} from {} remaining.",
                size, remaining
            )));
        }
        let data = self.read_raw(size).await?;
        self.read_bytes += size;
        self.state = ChannelState::AwaitingBody {
            remaining: remaining - size,
        };
        Ok(data)
    }

    /// Drain whatever is left of the current response.
    pub async fn flush_response(&mut self) -> Result<()> {
        if self.state == ChannelState::AwaitingHeader {
            if let Err(e) = self.read_header().await {
                // a rejected response is already drained
                if self.state != ChannelState::Writable {
                    return Err(e);
                }
                debug!("Flushed rejected response: {}", e);
                return Ok(());
            }
        }
        self.discard_body().await
    }

    async fn discard_body(&mut self) -> Result<()> {
        let mut remaining = self.remaining_bytes();
        while remaining > 0 {
            let chunk = remaining.min(DRAIN_CHUNK);
            self.read_raw(chunk).await?;
            remaining -= chunk;
            self.state = ChannelState::AwaitingBody { remaining };
        }
        if self.socket.is_some() {
            self.state = ChannelState::Writable;
        }
        Ok(())
    }

    async fn read_raw(&mut self, len: usize) -> Result<Bytes> {
        let deadline = self.config.timeout;
        let socket = self.socket_mut()?;
        let mut buf = vec![0u8; len];
        let result = with_timeout(deadline, socket.read_exact(&mut buf)).await;
        match result {
            Ok(_) => {
                self.metrics.record_received(len as u64);
                Ok(Bytes::from(buf))
            }
            Err(IoFailure::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.close();
                Err(KafkaClientError::end_of_stream(
                    "No response data received from kafka broker.",
                ))
            }
            Err(IoFailure::Io(e)) => {
                self.close();
                self.metrics.record_connection_error();
                Err(KafkaClientError::transport(format!(
                    "Could not read from the kafka channel socket: {}",
                    e
                )))
            }
            Err(IoFailure::Timeout) => {
                self.close();
                Err(KafkaClientError::timeout(deadline.as_millis() as u64))
            }
        }
    }

    fn socket_mut(&mut self) -> Result<&mut TcpStream> {
        self.socket
            .as_mut()
            .ok_or_else(|| KafkaClientError::illegal_state("Kafka channel is not connected."))
    }

    fn timeout_ms(&self) -> u64 {
        self.config.timeout.as_millis() as u64
    }
}

enum IoFailure {
    Timeout,
    Io(io::Error),
}

async fn with_timeout<F, T>(deadline: Duration, future: F) -> std::result::Result<T, IoFailure>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(deadline, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(IoFailure::Io(e)),
        Err(_) => Err(IoFailure::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> Channel {
        Channel::new(
            ConnectionConfig::new("127.0.0.1", 1),
            Arc::new(ClientMetrics::default()),
        )
    }

    #[test]
    fn test_new_channel_is_idle() {
        let channel = channel();
        assert_eq!(channel.state(), ChannelState::Idle);
        assert_eq!(channel.read_bytes(), 0);
        assert_eq!(channel.remaining_bytes(), 0);
    }

    #[tokio::test]
    async fn test_read_before_send_is_illegal() {
        let mut channel = channel();
        assert!(matches!(
            channel.read(4).await,
            Err(KafkaClientError::IllegalState { .. })
        ));
        assert!(matches!(
            channel.has_incoming_data().await,
            Err(KafkaClientError::IllegalState { .. })
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut channel = channel();
        channel.close();
        channel.close();
        assert_eq!(channel.state(), ChannelState::Idle);
    }
}
