//! Plaintext TCP transport implementation.
//!
//! Frames travel unencrypted with a zero indicator byte and varint length
//! prefix. Used for devices configured without an encryption key.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::ProtoMessage;
use crate::protocol::frame::{self, PlaintextCodec};
use crate::transport::{FrameEvent, FrameTransport};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Plaintext transport over TCP.
///
/// Uses split read/write halves so the background read loop never blocks
/// sends.
pub struct PlaintextTransport {
    address: String,
    writer: Option<Arc<Mutex<OwnedWriteHalf>>>,
    events: Option<mpsc::Receiver<FrameEvent>>,
    read_task: Option<JoinHandle<()>>,
}

impl PlaintextTransport {
    /// Creates a new plaintext transport for the given `host:port` address.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            writer: None,
            events: None,
            read_task: None,
        }
    }

    /// Runs the read loop, decoding frames and forwarding them as events.
    async fn run_read_loop(
        mut reader: OwnedReadHalf,
        event_tx: mpsc::Sender<FrameEvent>,
    ) {
        let mut codec = PlaintextCodec::new();
        let mut buf = [0u8; 4096];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("connection closed by peer");
                    let _ = event_tx.send(FrameEvent::Closed).await;
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("read error: {}", e);
                    let _ = event_tx.send(FrameEvent::Error(e.to_string())).await;
                    return;
                }
            };

            tracing::trace!("received {} bytes", n);
            codec.feed(&buf[..n]);

            loop {
                match codec.next_message() {
                    Ok(Some(message)) => {
                        tracing::trace!(
                            "decoded message type {} ({} bytes)",
                            message.type_id,
                            message.payload.len()
                        );
                        if event_tx.send(FrameEvent::Message(message)).await.is_err() {
                            tracing::debug!("event receiver dropped");
                            return;
                        }
                    }
                    Ok(None) => break, // Need more data
                    Err(e) => {
                        // Framing errors are unrecoverable, the byte stream
                        // has no resynchronization point
                        tracing::error!("frame decode error: {}", e);
                        let _ = event_tx.send(FrameEvent::Error(e.to_string())).await;
                        return;
                    }
                }
            }
        }
    }
}

impl FrameTransport for PlaintextTransport {
    fn connect(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.writer.is_some() {
                return Ok(());
            }

            tracing::info!("connecting to {}", self.address);

            let stream = TcpStream::connect(&self.address).await.map_err(Error::Io)?;
            stream.set_nodelay(true).map_err(Error::Io)?;

            let (reader, writer) = stream.into_split();
            let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

            self.writer = Some(Arc::new(Mutex::new(writer)));
            self.events = Some(event_rx);
            self.read_task = Some(tokio::spawn(Self::run_read_loop(reader, event_tx)));

            tracing::info!("connected");
            Ok(())
        })
    }

    fn disconnect(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.writer.is_some() {
                tracing::info!("disconnecting from {}", self.address);
            }
            if let Some(task) = self.read_task.take() {
                task.abort();
            }
            self.writer = None;
            self.events = None;
            Ok(())
        })
    }

    fn send_message(
        &mut self,
        message: ProtoMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let writer = self.writer.clone();
        Box::pin(async move {
            let writer = writer.ok_or(Error::NotConnected)?;
            let mut writer = writer.lock().await;

            let frame = frame::encode(&message);
            tracing::trace!("sending frame: {} bytes", frame.len());

            writer.write_all(&frame).await.map_err(Error::Io)?;
            writer.flush().await.map_err(Error::Io)?;

            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.writer.is_some()
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<FrameEvent>> {
        self.events.take()
    }
}

impl Drop for PlaintextTransport {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}
