//! Transport Module
//!
//! One message per TCP connection: the sender dials, writes a single line
//! and closes (optionally after reading one reply line). The listener hands
//! every accepted connection to a [`MessageHandler`] on its own task.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use acablock_protocol::{Message, ProtocolError};

/// Configuration for network operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Timeout for establishing an outbound connection (milliseconds)
    pub connect_timeout_ms: u64,
    /// Timeout for a single line read or write (milliseconds)
    pub io_timeout_ms: u64,
    /// Maximum number of inbound connections handled at once
    pub max_concurrent_handlers: usize,
    /// Longest accepted line, newline included (bytes)
    pub max_line_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3000,          // 3 seconds
            io_timeout_ms: 5000,               // 5 seconds
            max_concurrent_handlers: 64,       // 64 connections
            max_line_bytes: 16 * 1024 * 1024, // 16 MiB
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection to {addr} failed: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    #[error("Timed out during {operation} with {addr}")]
    Timeout {
        addr: String,
        operation: &'static str,
    },

    #[error("Connection to {addr} closed before a reply arrived")]
    ConnectionClosed { addr: String },

    #[error("Listener stopped accepting: {reason}")]
    Accept { reason: String },

    #[error("Protocol error: {source}")]
    Protocol {
        #[from]
        source: ProtocolError,
    },
}

impl TransportError {
    /// Network-level failure against a peer, worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionFailed { .. }
                | TransportError::Timeout { .. }
                | TransportError::ConnectionClosed { .. }
        )
    }
}

/// Receives the decoded message of every inbound connection.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    type Error: Display + Send;

    /// Process one message; a returned message is written back as the reply.
    async fn handle(&self, message: Message) -> Result<Option<Message>, Self::Error>;

    /// Called when a connection delivers a line that does not decode.
    fn malformed(&self, peer: SocketAddr, error: &ProtocolError) {
        warn!(%peer, error = %error, "Dropping malformed message");
    }
}

/// Send one message and close the connection.
pub async fn send(
    addr: &str,
    message: &Message,
    config: &TransportConfig,
) -> Result<(), TransportError> {
    let line = message.encode()?;
    let mut stream = connect(addr, config).await?;
    write_line(&mut stream, addr, &line, config).await?;
    debug!(peer = addr, kind = ?message.kind, "Sent message");
    Ok(())
}

/// Send one message and wait for a single reply line.
pub async fn send_and_await_reply(
    addr: &str,
    message: &Message,
    config: &TransportConfig,
) -> Result<Message, TransportError> {
    let line = message.encode()?;
    let stream = connect(addr, config).await?;
    let (reader, mut writer) = stream.into_split();
    write_line(&mut writer, addr, &line, config).await?;

    let reply = read_line(reader, addr, config)
        .await?
        .ok_or_else(|| TransportError::ConnectionClosed {
            addr: addr.to_string(),
        })?;
    Ok(Message::decode(&reply)?)
}

/// Accept connections until the listener fails, one task per connection.
pub async fn serve<H: MessageHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    config: TransportConfig,
) -> Result<(), TransportError> {
    let permits = Arc::new(Semaphore::new(config.max_concurrent_handlers.max(1)));
    if let Ok(local) = listener.local_addr() {
        info!(%local, max_handlers = config.max_concurrent_handlers, "Accepting connections");
    }

    loop {
        // waiting for a permit before accepting is the backpressure
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Ok(()),
        };

        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "Accept failed, stopping listener");
                return Err(TransportError::Accept {
                    reason: e.to_string(),
                });
            }
        };

        let handler = handler.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let _permit = permit;
            handle_connection(stream, peer, handler.as_ref(), &config).await;
        });
    }
}

async fn handle_connection<H: MessageHandler>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: &H,
    config: &TransportConfig,
) {
    let peer_label = peer.to_string();
    let (reader, mut writer) = stream.into_split();

    let line = match read_line(reader, &peer_label, config).await {
        Ok(Some(line)) => line,
        Ok(None) => {
            debug!(%peer, "Connection closed without a message");
            return;
        }
        Err(TransportError::Protocol { source }) => {
            handler.malformed(peer, &source);
            return;
        }
        Err(e) => {
            debug!(%peer, error = %e, "Failed to read message");
            return;
        }
    };

    let message = match Message::decode(&line) {
        Ok(message) => message,
        Err(e) => {
            handler.malformed(peer, &e);
            return;
        }
    };

    match handler.handle(message).await {
        Ok(Some(reply)) => {
            let written = match reply.encode() {
                Ok(encoded) => write_line(&mut writer, &peer_label, &encoded, config).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = written {
                debug!(%peer, error = %e, "Failed to write reply");
            }
        }
        Ok(None) => {}
        Err(e) => warn!(%peer, error = %e, "Message handler failed"),
    }
}

async fn connect(addr: &str, config: &TransportConfig) -> Result<TcpStream, TransportError> {
    timeout(config.connect_timeout(), TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout {
            addr: addr.to_string(),
            operation: "connect",
        })?
        .map_err(|e| TransportError::ConnectionFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        })
}

async fn write_line<W: AsyncWrite + Unpin>(
    writer: &mut W,
    addr: &str,
    line: &str,
    config: &TransportConfig,
) -> Result<(), TransportError> {
    let write = async {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    };
    timeout(config.io_timeout(), write)
        .await
        .map_err(|_| TransportError::Timeout {
            addr: addr.to_string(),
            operation: "write",
        })?
        .map_err(|e| TransportError::ConnectionFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        })
}

/// Read one line; `None` if the peer closed before sending anything.
async fn read_line<R: AsyncRead + Unpin>(
    reader: R,
    addr: &str,
    config: &TransportConfig,
) -> Result<Option<String>, TransportError> {
    let mut reader = BufReader::new(reader.take(config.max_line_bytes as u64));
    let mut line = String::new();

    let read = timeout(config.io_timeout(), reader.read_line(&mut line))
        .await
        .map_err(|_| TransportError::Timeout {
            addr: addr.to_string(),
            operation: "read",
        })?;

    match read {
        Ok(0) => Ok(None),
        Ok(n) if n >= config.max_line_bytes && !line.ends_with('\n') => {
            warn!(peer = addr, limit = config.max_line_bytes, "Line too long, dropping");
            Err(ProtocolError::MalformedMessage {
                reason: format!("line too long (limit {} bytes)", config.max_line_bytes),
            }
            .into())
        }
        Ok(_) => Ok(Some(line)),
        Err(e) if e.kind() == ErrorKind::InvalidData => Err(ProtocolError::MalformedMessage {
            reason: "line is not valid UTF-8".to_string(),
        }
        .into()),
        Err(e) => Err(TransportError::ConnectionFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acablock_protocol::MessageKind;
    use tokio::sync::mpsc;

    struct Recorder {
        tx: mpsc::UnboundedSender<Message>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        type Error = String;

        async fn handle(&self, message: Message) -> Result<Option<Message>, String> {
            let _ = self.tx.send(message.clone());
            // echo host lists back so the reply path is exercised
            if message.kind == MessageKind::AddHost {
                return Ok(Some(message));
            }
            Ok(None)
        }
    }

    async fn start_recorder(
        config: TransportConfig,
    ) -> (String, mpsc::UnboundedReceiver<Message>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(listener, Arc::new(Recorder { tx }), config));
        (addr, rx)
    }

    async fn closed_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.io_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_concurrent_handlers, 64);
    }

    #[tokio::test]
    async fn test_send_delivers_message() {
        let (addr, mut rx) = start_recorder(TransportConfig::default()).await;

        let message = Message::new_host("127.0.0.1:9001");
        send(&addr, &message, &TransportConfig::default()).await.unwrap();

        let received = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(received, Some(message));
    }

    #[tokio::test]
    async fn test_send_and_await_reply() {
        let (addr, _rx) = start_recorder(TransportConfig::default()).await;

        let message = Message::add_host(&["a:1", "b:2"]);
        let reply = send_and_await_reply(&addr, &message, &TransportConfig::default())
            .await
            .unwrap();
        assert_eq!(reply, message);
    }

    #[tokio::test]
    async fn test_reply_missing_is_reported() {
        let (addr, _rx) = start_recorder(TransportConfig::default()).await;

        let result = send_and_await_reply(
            &addr,
            &Message::new_block("127.0.0.1:9001"),
            &TransportConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed { .. })));
    }

    #[tokio::test]
    async fn test_send_to_closed_port_fails() {
        let addr = closed_addr().await;
        let err = send(&addr, &Message::new_host("x:1"), &TransportConfig::default())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        // accepts but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let config = TransportConfig {
            io_timeout_ms: 100,
            ..Default::default()
        };
        let result = send_and_await_reply(&addr, &Message::new_block("x:1"), &config).await;
        assert!(matches!(
            result,
            Err(TransportError::Timeout {
                operation: "read",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_stop_listener() {
        let (addr, mut rx) = start_recorder(TransportConfig::default()).await;

        let mut raw = TcpStream::connect(&addr).await.unwrap();
        raw.write_all(b"not a message\n").await.unwrap();
        drop(raw);

        let message = Message::new_block("127.0.0.1:9001");
        send(&addr, &message, &TransportConfig::default()).await.unwrap();
        let received = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(received, Some(message));
    }

    #[tokio::test]
    async fn test_oversized_line_is_reported() {
        let config = TransportConfig {
            max_line_bytes: 16,
            ..Default::default()
        };
        let input: &[u8] = b"{\"kind\":1,\"payload\":\"a:1,b:2,c:3\"}\n";
        match read_line(input, "peer", &config).await {
            Err(TransportError::Protocol {
                source: ProtocolError::MalformedMessage { reason },
            }) => assert!(reason.contains("too long")),
            other => panic!("expected an oversized line error, got {:?}", other),
        }

        // a line that fits, newline included, is read whole
        let fits: &[u8] = b"0123456789abcde\n";
        assert_eq!(
            read_line(fits, "peer", &config).await.unwrap().as_deref(),
            Some("0123456789abcde\n")
        );
    }

    #[tokio::test]
    async fn test_single_handler_slot_serves_sequential_connections() {
        let config = TransportConfig {
            max_concurrent_handlers: 1,
            ..Default::default()
        };
        let (addr, mut rx) = start_recorder(config).await;

        for i in 0..3 {
            let message = Message::new_host(&format!("127.0.0.1:{}", 9000 + i));
            send(&addr, &message, &TransportConfig::default()).await.unwrap();
            let received = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
            assert_eq!(received, Some(message));
        }
    }
}
