//! Encrypted framing: Noise handshake and per-frame AEAD.
//!
//! The encrypted mode wraps every frame in an unencrypted outer envelope:
//! ```text
//! ┌──────────┬──────────────┬─────────────────┐
//! │  0x01    │  len (BE)    │      body       │
//! │  1 byte  │   2 bytes    │    len bytes    │
//! └──────────┴──────────────┴─────────────────┘
//! ```
//! During the handshake the body is Noise control data; afterwards it is
//! the AEAD ciphertext of `[type:u16 BE][len:u16 BE][payload]`.
//!
//! The handshake pattern is `NNpsk0` over Curve25519/ChaCha20-Poly1305/
//! SHA-256: no static keys, mutual authentication through the pre-shared
//! 32-byte key, fresh ephemeral keys per session.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use snow::{HandshakeState, StatelessTransportState};

use crate::error::{Error, FrameError, Result};
use crate::protocol::frame::NOISE_INDICATOR;
use crate::protocol::message::ProtoMessage;

/// Noise protocol name negotiated with the device.
pub const NOISE_PATTERN: &str = "Noise_NNpsk0_25519_ChaChaPoly_SHA256";

/// Handshake prologue fixed by the native API.
pub const NOISE_PROLOGUE: &[u8] = b"NoiseAPIInit\x00\x00";

/// AEAD tag overhead per sealed frame.
const TAG_LEN: usize = 16;

/// Encodes an outer envelope around `body`.
#[must_use]
pub fn encode_frame(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(3 + body.len());
    buf.put_u8(NOISE_INDICATOR);
    buf.put_u16(body.len() as u16);
    buf.put_slice(body);
    buf.freeze()
}

/// Streaming extractor for outer envelopes.
#[derive(Debug, Default)]
pub struct NoiseCodec {
    buffer: BytesMut,
}

impl NoiseCodec {
    /// Creates a new codec with an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a received chunk to the accumulation buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to extract the next complete envelope body.
    ///
    /// Returns `Ok(None)` until the full declared length is buffered.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::BadIndicator` when the envelope does not open
    /// with the encryption marker.
    pub fn next_frame(&mut self) -> std::result::Result<Option<Bytes>, FrameError> {
        if self.buffer.len() < 3 {
            return Ok(None);
        }
        let indicator = self.buffer[0];
        if indicator != NOISE_INDICATOR {
            return Err(FrameError::BadIndicator {
                expected: NOISE_INDICATOR,
                got: indicator,
            });
        }
        let length = usize::from(u16::from_be_bytes([self.buffer[1], self.buffer[2]]));
        if self.buffer.len() < 3 + length {
            return Ok(None);
        }
        self.buffer.advance(3);
        Ok(Some(self.buffer.split_to(length).freeze()))
    }

    /// Discards all buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Handshake progression for one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Waiting for the server hello after our empty trigger frame.
    Hello,
    /// Initiator message sent, waiting for the responder message.
    Handshake,
    /// Transport keys derived, application frames flow.
    Ready,
    /// Transport closed; a new handshake starts on the next connect.
    Closed,
}

/// Output of feeding one handshake frame.
#[derive(Debug)]
pub enum HandshakeStep {
    /// Send this frame body to the peer and keep going.
    Reply(Bytes),
    /// Handshake finished; switch to sealed application frames.
    Complete(NoiseCipher),
}

/// Client-side Noise handshake driver.
///
/// The caller owns frame extraction; this type interprets handshake-stage
/// frame bodies and yields the frames to send back. Any error is terminal
/// for the attempt: retry happens only through a fresh handshake on
/// reconnect.
pub struct NoiseHandshake {
    phase: HandshakePhase,
    state: Option<HandshakeState>,
    expected_server_name: Option<String>,
}

impl NoiseHandshake {
    /// Builds the initiator state seeded with the pre-shared key.
    ///
    /// # Errors
    ///
    /// Returns an error if the Noise state cannot be constructed.
    pub fn new(psk: &[u8; 32], expected_server_name: Option<String>) -> Result<Self> {
        let params: snow::params::NoiseParams = NOISE_PATTERN.parse()?;
        let state = snow::Builder::new(params)
            .prologue(NOISE_PROLOGUE)?
            .psk(0, psk)?
            .build_initiator()?;
        Ok(Self {
            phase: HandshakePhase::Hello,
            state: Some(state),
            expected_server_name,
        })
    }

    /// Current handshake phase.
    #[must_use]
    pub const fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Marks the handshake closed after transport loss.
    pub fn close(&mut self) {
        self.phase = HandshakePhase::Closed;
    }

    /// Feeds one handshake-stage frame body.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for an unknown selector, a handshake error
    /// for a server identity mismatch or a non-zero responder status, and a
    /// Noise error if key derivation fails. No reply frame is produced on
    /// any error path.
    pub fn advance(&mut self, frame: &[u8]) -> Result<HandshakeStep> {
        match self.phase {
            HandshakePhase::Hello => self.handle_hello(frame),
            HandshakePhase::Handshake => self.handle_handshake(frame),
            HandshakePhase::Ready | HandshakePhase::Closed => Err(Error::Protocol {
                message: "handshake frame after completion".into(),
            }),
        }
    }

    fn handle_hello(&mut self, frame: &[u8]) -> Result<HandshakeStep> {
        let selector = frame.first().copied().ok_or_else(|| Error::Protocol {
            message: "empty server hello".into(),
        })?;
        if selector != 1 {
            return Err(Error::Protocol {
                message: format!("unknown protocol selected by server: {selector}"),
            });
        }
        if let Some(expected) = &self.expected_server_name {
            // Server name is NUL-terminated starting at byte 1
            if let Some(end) = frame[1..].iter().position(|&b| b == 0) {
                let server_name = String::from_utf8_lossy(&frame[1..1 + end]);
                if *expected != server_name {
                    return Err(Error::Handshake {
                        message: format!(
                            "server name mismatch: expected {expected}, got {server_name}"
                        ),
                    });
                }
            }
        }

        let state = self.state.as_mut().ok_or_else(|| Error::Protocol {
            message: "handshake state consumed".into(),
        })?;
        let mut out = vec![0_u8; 128];
        let n = state.write_message(&[], &mut out)?;
        let mut reply = BytesMut::with_capacity(1 + n);
        reply.put_u8(0);
        reply.put_slice(&out[..n]);
        self.phase = HandshakePhase::Handshake;
        Ok(HandshakeStep::Reply(reply.freeze()))
    }

    fn handle_handshake(&mut self, frame: &[u8]) -> Result<HandshakeStep> {
        let status = frame.first().copied().ok_or_else(|| Error::Protocol {
            message: "empty handshake frame".into(),
        })?;
        if status != 0 {
            return Err(Error::Handshake {
                message: String::from_utf8_lossy(&frame[1..]).into_owned(),
            });
        }

        let mut state = self.state.take().ok_or_else(|| Error::Protocol {
            message: "handshake state consumed".into(),
        })?;
        let mut payload = vec![0_u8; frame.len()];
        state.read_message(&frame[1..], &mut payload)?;
        let transport = state.into_stateless_transport_mode()?;
        self.phase = HandshakePhase::Ready;
        Ok(HandshakeStep::Complete(NoiseCipher {
            transport,
            send_nonce: AtomicU64::new(0),
            recv_nonce: AtomicU64::new(0),
        }))
    }
}

/// Split transport keys derived from a completed handshake.
///
/// Each direction keeps its own monotonically increasing nonce, so sealing
/// and opening can proceed concurrently from the write path and the read
/// loop without exclusive access.
pub struct NoiseCipher {
    transport: StatelessTransportState,
    send_nonce: AtomicU64,
    recv_nonce: AtomicU64,
}

// The transport state holds key material and has no Debug of its own
impl std::fmt::Debug for NoiseCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseCipher")
            .field("send_nonce", &self.send_nonce)
            .field("recv_nonce", &self.recv_nonce)
            .finish_non_exhaustive()
    }
}

impl NoiseCipher {
    /// Seals an outgoing message into a complete wire frame.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption fails.
    pub fn seal(&self, message: &ProtoMessage) -> Result<Bytes> {
        let mut plaintext = BytesMut::with_capacity(4 + message.payload.len());
        plaintext.put_u16(message.type_id as u16);
        plaintext.put_u16(message.payload.len() as u16);
        plaintext.put_slice(&message.payload);

        let nonce = self.send_nonce.fetch_add(1, Ordering::Relaxed);
        let mut ciphertext = vec![0_u8; plaintext.len() + TAG_LEN];
        let n = self
            .transport
            .write_message(nonce, &plaintext, &mut ciphertext)?;
        Ok(encode_frame(&ciphertext[..n]))
    }

    /// Opens one envelope body into the message it carries.
    ///
    /// # Errors
    ///
    /// Returns an error on authentication failure or if the decrypted
    /// record is malformed.
    pub fn open(&self, ciphertext: &[u8]) -> Result<ProtoMessage> {
        let nonce = self.recv_nonce.fetch_add(1, Ordering::Relaxed);
        let mut plaintext = vec![0_u8; ciphertext.len()];
        let n = self
            .transport
            .read_message(nonce, ciphertext, &mut plaintext)?;
        let plaintext = &plaintext[..n];

        if plaintext.len() < 4 {
            return Err(Error::Frame(FrameError::BadLength {
                declared: 4,
                got: plaintext.len(),
            }));
        }
        let type_id = u32::from(u16::from_be_bytes([plaintext[0], plaintext[1]]));
        let declared = usize::from(u16::from_be_bytes([plaintext[2], plaintext[3]]));
        let payload = &plaintext[4..];
        if declared != payload.len() {
            return Err(Error::Frame(FrameError::BadLength {
                declared,
                got: payload.len(),
            }));
        }
        Ok(ProtoMessage {
            type_id,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::MessageType;

    const PSK: [u8; 32] = [7; 32];

    fn responder() -> HandshakeState {
        snow::Builder::new(NOISE_PATTERN.parse().unwrap())
            .prologue(NOISE_PROLOGUE)
            .unwrap()
            .psk(0, &PSK)
            .unwrap()
            .build_responder()
            .unwrap()
    }

    fn server_hello(name: &str) -> Vec<u8> {
        let mut hello = vec![1_u8];
        hello.extend_from_slice(name.as_bytes());
        hello.push(0);
        hello
    }

    #[test]
    fn test_envelope_roundtrip_across_chunks() {
        let frame = encode_frame(b"body-bytes");
        let mut codec = NoiseCodec::new();
        for split in 0..=frame.len() {
            codec.clear();
            codec.feed(&frame[..split]);
            let first = codec.next_frame().unwrap();
            codec.feed(&frame[split..]);
            let second = codec.next_frame().unwrap();
            let body = first.or(second).expect("complete frame");
            assert_eq!(body.as_ref(), b"body-bytes");
        }
    }

    #[test]
    fn test_envelope_rejects_plaintext_indicator() {
        let mut codec = NoiseCodec::new();
        codec.feed(&[0x00, 0x00, 0x01, 0xAA]);
        assert!(matches!(
            codec.next_frame(),
            Err(FrameError::BadIndicator { got: 0x00, .. })
        ));
    }

    #[test]
    fn test_unknown_selector_rejected_without_reply() {
        let mut handshake = NoiseHandshake::new(&PSK, None).unwrap();
        let mut hello = server_hello("x");
        hello[0] = 2;
        let result = handshake.advance(&hello);
        assert!(matches!(result, Err(Error::Protocol { .. })));
        // No initiator message was produced, phase is unchanged
        assert_eq!(handshake.phase(), HandshakePhase::Hello);
    }

    #[test]
    fn test_server_name_mismatch_rejected_before_handshake() {
        let mut handshake = NoiseHandshake::new(&PSK, Some("expected".into())).unwrap();
        let result = handshake.advance(&server_hello("actual"));
        assert!(matches!(result, Err(Error::Handshake { .. })));
        assert_eq!(handshake.phase(), HandshakePhase::Hello);
    }

    #[test]
    fn test_server_name_match_produces_marked_reply() {
        let mut handshake = NoiseHandshake::new(&PSK, Some("device".into())).unwrap();
        let HandshakeStep::Reply(reply) = handshake.advance(&server_hello("device")).unwrap()
        else {
            panic!("expected reply");
        };
        assert_eq!(reply[0], 0);
        assert!(reply.len() > 1);
        assert_eq!(handshake.phase(), HandshakePhase::Handshake);
    }

    #[test]
    fn test_nonzero_status_surfaces_reason() {
        let mut handshake = NoiseHandshake::new(&PSK, None).unwrap();
        let HandshakeStep::Reply(_) = handshake.advance(&server_hello("d")).unwrap() else {
            panic!("expected reply");
        };
        let mut failure = vec![1_u8];
        failure.extend_from_slice(b"Handshake MAC failure");
        let result = handshake.advance(&failure);
        match result {
            Err(Error::Handshake { message }) => assert_eq!(message, "Handshake MAC failure"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_full_handshake_and_transport_roundtrip() {
        let mut initiator = NoiseHandshake::new(&PSK, Some("device".into())).unwrap();
        let mut responder = responder();

        let HandshakeStep::Reply(msg1) = initiator.advance(&server_hello("device")).unwrap()
        else {
            panic!("expected initiator message");
        };
        let mut scratch = vec![0_u8; 128];
        responder.read_message(&msg1[1..], &mut scratch).unwrap();

        let mut msg2 = vec![0_u8; 128];
        let n = responder.write_message(&[], &mut msg2).unwrap();
        let mut server_frame = vec![0_u8];
        server_frame.extend_from_slice(&msg2[..n]);

        let HandshakeStep::Complete(cipher) = initiator.advance(&server_frame).unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(initiator.phase(), HandshakePhase::Ready);
        let server = responder.into_stateless_transport_mode().unwrap();

        // Client to server
        let sealed = cipher
            .seal(&ProtoMessage::new(
                MessageType::PingRequest,
                Bytes::from_static(b"abc"),
            ))
            .unwrap();
        assert_eq!(sealed[0], NOISE_INDICATOR);
        let body_len = usize::from(u16::from_be_bytes([sealed[1], sealed[2]]));
        let mut plaintext = vec![0_u8; body_len];
        let n = server
            .read_message(0, &sealed[3..3 + body_len], &mut plaintext)
            .unwrap();
        assert_eq!(&plaintext[..n], &[0, 7, 0, 3, b'a', b'b', b'c']);

        // Server to client
        let inner = [0_u8, 8, 0, 0];
        let mut ciphertext = vec![0_u8; inner.len() + 16];
        let n = server.write_message(0, &inner, &mut ciphertext).unwrap();
        let opened = cipher.open(&ciphertext[..n]).unwrap();
        assert_eq!(opened.message_type(), Some(MessageType::PingResponse));
        assert!(opened.payload.is_empty());
    }
}
