//! Noise-encrypted TCP transport implementation.
//!
//! Connecting performs the full NNpsk0 handshake before resolving, so a
//! successful `connect` means application frames can flow immediately. The
//! derived cipher is shared between the write path and the read loop.

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
use crate::protocol::noise::{self, HandshakeStep, NoiseCipher, NoiseCodec, NoiseHandshake};
use crate::transport::{FrameEvent, FrameTransport};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Encrypted transport over TCP.
pub struct NoiseTransport {
    address: String,
    psk: [u8; 32],
    expected_server_name: Option<String>,
    writer: Option<Arc<Mutex<OwnedWriteHalf>>>,
    cipher: Option<Arc<NoiseCipher>>,
    events: Option<mpsc::Receiver<FrameEvent>>,
    read_task: Option<JoinHandle<()>>,
}

impl NoiseTransport {
    /// Creates a new encrypted transport.
    ///
    /// When `expected_server_name` is set the handshake fails unless the
    /// device reports exactly that name in its hello.
    #[must_use]
    pub fn new(
        address: impl Into<String>,
        psk: [u8; 32],
        expected_server_name: Option<String>,
    ) -> Self {
        Self {
            address: address.into(),
            psk,
            expected_server_name,
            writer: None,
            cipher: None,
            events: None,
            read_task: None,
        }
    }

    /// Drives the handshake to completion over the split stream.
    ///
    /// Returns the derived cipher plus the codec, which may already hold
    /// application bytes that arrived directly behind the final handshake
    /// frame.
    async fn perform_handshake(
        &self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(NoiseCipher, NoiseCodec)> {
        let mut handshake = NoiseHandshake::new(&self.psk, self.expected_server_name.clone())?;
        let mut codec = NoiseCodec::new();
        let mut buf = [0u8; 1024];

        // Empty client hello kicks off the exchange
        writer.write_all(&noise::encode_frame(&[])).await?;
        writer.flush().await?;

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::Handshake {
                    message: "connection closed during handshake".into(),
                });
            }
            codec.feed(&buf[..n]);

            while let Some(frame) = codec.next_frame()? {
                match handshake.advance(&frame)? {
                    HandshakeStep::Reply(body) => {
                        writer.write_all(&noise::encode_frame(&body)).await?;
                        writer.flush().await?;
                    }
                    HandshakeStep::Complete(cipher) => {
                        tracing::debug!("handshake complete");
                        return Ok((cipher, codec));
                    }
                }
            }
        }
    }

    /// Runs the read loop, opening sealed frames and forwarding them.
    async fn run_read_loop(
        mut reader: OwnedReadHalf,
        mut codec: NoiseCodec,
        cipher: Arc<NoiseCipher>,
        event_tx: mpsc::Sender<FrameEvent>,
    ) {
        let mut buf = [0u8; 4096];

        loop {
            // Frames buffered during the handshake come first
            loop {
                let frame = match codec.next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("frame decode error: {}", e);
                        let _ = event_tx.send(FrameEvent::Error(e.to_string())).await;
                        return;
                    }
                };
                match cipher.open(&frame) {
                    Ok(message) => {
                        tracing::trace!(
                            "decrypted message type {} ({} bytes)",
                            message.type_id,
                            message.payload.len()
                        );
                        if event_tx.send(FrameEvent::Message(message)).await.is_err() {
                            tracing::debug!("event receiver dropped");
                            return;
                        }
                    }
                    Err(e) => {
                        // A failed open desynchronizes the nonce sequence,
                        // the session cannot continue
                        tracing::error!("decrypt error: {}", e);
                        let _ = event_tx.send(FrameEvent::Error(e.to_string())).await;
                        return;
                    }
                }
            }

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
        }
    }
}

impl FrameTransport for NoiseTransport {
    fn connect(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.writer.is_some() {
                return Ok(());
            }

            tracing::info!("connecting to {} (encrypted)", self.address);

            let stream = TcpStream::connect(&self.address).await.map_err(Error::Io)?;
            stream.set_nodelay(true).map_err(Error::Io)?;
            let (mut reader, mut writer) = stream.into_split();

            let (cipher, codec) = self.perform_handshake(&mut reader, &mut writer).await?;
            let cipher = Arc::new(cipher);
            let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

            self.writer = Some(Arc::new(Mutex::new(writer)));
            self.cipher = Some(Arc::clone(&cipher));
            self.events = Some(event_rx);
            self.read_task = Some(tokio::spawn(Self::run_read_loop(
                reader, codec, cipher, event_tx,
            )));

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
            self.cipher = None;
            self.events = None;
            Ok(())
        })
    }

    fn send_message(
        &mut self,
        message: ProtoMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let writer = self.writer.clone();
        let cipher = self.cipher.clone();
        Box::pin(async move {
            let writer = writer.ok_or(Error::NotConnected)?;
            let cipher = cipher.ok_or(Error::NotConnected)?;

            let frame = cipher.seal(&message)?;
            tracing::trace!("sending sealed frame: {} bytes", frame.len());

            let mut writer = writer.lock().await;
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

impl Drop for NoiseTransport {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use snow::HandshakeState;
    use tokio::net::TcpListener;

    use super::*;
    use crate::protocol::message::MessageType;
    use crate::protocol::noise::{NOISE_PATTERN, NOISE_PROLOGUE};

    const PSK: [u8; 32] = [42; 32];

    fn responder() -> HandshakeState {
        snow::Builder::new(NOISE_PATTERN.parse().unwrap())
            .prologue(NOISE_PROLOGUE)
            .unwrap()
            .psk(0, &PSK)
            .unwrap()
            .build_responder()
            .unwrap()
    }

    async fn read_envelope(socket: &mut TcpStream) -> Vec<u8> {
        let mut header = [0u8; 3];
        socket.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x01);
        let len = usize::from(u16::from_be_bytes([header[1], header[2]]));
        let mut body = vec![0u8; len];
        socket.read_exact(&mut body).await.unwrap();
        body
    }

    async fn serve_handshake(socket: &mut TcpStream) -> snow::StatelessTransportState {
        // Client trigger frame is empty
        let trigger = read_envelope(socket).await;
        assert!(trigger.is_empty());

        let mut hello = vec![1u8];
        hello.extend_from_slice(b"device\0");
        socket
            .write_all(&noise::encode_frame(&hello))
            .await
            .unwrap();

        let mut state = responder();
        let msg1 = read_envelope(socket).await;
        assert_eq!(msg1[0], 0);
        let mut scratch = vec![0u8; 128];
        state.read_message(&msg1[1..], &mut scratch).unwrap();

        let mut msg2 = vec![0u8; 128];
        let n = state.write_message(&[], &mut msg2).unwrap();
        let mut reply = vec![0u8];
        reply.extend_from_slice(&msg2[..n]);
        socket
            .write_all(&noise::encode_frame(&reply))
            .await
            .unwrap();

        state.into_stateless_transport_mode().unwrap()
    }

    fn seal_inner(
        state: &snow::StatelessTransportState,
        nonce: u64,
        message_type: MessageType,
        payload: &[u8],
    ) -> Bytes {
        let type_id = message_type.id() as u16;
        let mut inner = Vec::with_capacity(4 + payload.len());
        inner.extend_from_slice(&type_id.to_be_bytes());
        inner.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        inner.extend_from_slice(payload);

        let mut ciphertext = vec![0u8; inner.len() + 16];
        let n = state.write_message(nonce, &inner, &mut ciphertext).unwrap();
        noise::encode_frame(&ciphertext[..n])
    }

    #[tokio::test]
    async fn test_handshake_then_bidirectional_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let state = serve_handshake(&mut socket).await;

            // Push one message, then verify one from the client
            let frame = seal_inner(&state, 0, MessageType::PingRequest, &[]);
            socket.write_all(&frame).await.unwrap();

            let sealed = read_envelope(&mut socket).await;
            let mut plaintext = vec![0u8; sealed.len()];
            let n = state.read_message(0, &sealed, &mut plaintext).unwrap();
            assert_eq!(n, 4);
            let type_id = u16::from_be_bytes([plaintext[0], plaintext[1]]);
            assert_eq!(u32::from(type_id), MessageType::PingResponse.id());
        });

        let mut transport = NoiseTransport::new(address, PSK, Some("device".into()));
        transport.connect().await.unwrap();
        assert!(transport.is_connected());

        let mut events = transport.take_events().unwrap();
        match events.recv().await {
            Some(FrameEvent::Message(msg)) => {
                assert_eq!(msg.message_type(), Some(MessageType::PingRequest));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        transport
            .send_message(ProtoMessage::empty(MessageType::PingResponse))
            .await
            .unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_rejection_fails_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = read_envelope(&mut socket).await;

            let mut hello = vec![1u8];
            hello.extend_from_slice(b"device\0");
            socket
                .write_all(&noise::encode_frame(&hello))
                .await
                .unwrap();

            // Reject the initiator message with a failure status and reason
            let _ = read_envelope(&mut socket).await;
            let mut failure = vec![1u8];
            failure.extend_from_slice(b"Handshake MAC failure");
            socket
                .write_all(&noise::encode_frame(&failure))
                .await
                .unwrap();
        });

        let mut transport = NoiseTransport::new(address, PSK, None);
        let err = transport.connect().await.unwrap_err();
        match err {
            Error::Handshake { message } => assert_eq!(message, "Handshake MAC failure"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!transport.is_connected());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_name_mismatch_fails_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = read_envelope(&mut socket).await;
            let mut hello = vec![1u8];
            hello.extend_from_slice(b"other\0");
            socket
                .write_all(&noise::encode_frame(&hello))
                .await
                .unwrap();
        });

        let mut transport = NoiseTransport::new(address, PSK, Some("device".into()));
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, Error::Handshake { .. }));
        server.await.unwrap();
    }
}
