//! Error types for the esphome-native-api library.

use thiserror::Error;

/// The main error type for native API operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying TCP stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encoding/decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Invalid session configuration, raised at construction.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Protocol violation from the peer.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Noise handshake failed (bad selector, name mismatch, peer rejection).
    #[error("handshake error: {message}")]
    Handshake { message: String },

    /// Noise library failure during handshake or transport crypto.
    #[error("noise error: {0}")]
    Noise(#[from] snow::Error),

    /// The peer rejected the configured password.
    #[error("authentication failed: invalid password")]
    InvalidPassword,

    /// Correlated call timed out waiting for its response.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Connection is not established.
    #[error("not connected")]
    NotConnected,

    /// Command sent before the session was authorized.
    #[error("not authorized")]
    NotAuthorized,

    /// `connect()` called while a session is already active.
    #[error("already connected")]
    AlreadyConnected,

    /// Internal event channel closed.
    #[error("channel closed")]
    ChannelClosed,
}

/// Framing-specific errors.
#[derive(Debug, Error)]
pub enum FrameError {
    /// First byte of a frame did not match the expected indicator.
    #[error("bad frame indicator: expected {expected:#04x}, got {got:#04x}")]
    BadIndicator { expected: u8, got: u8 },

    /// Plaintext-configured connection received an encrypted frame marker.
    #[error("peer requires encryption but connection is plaintext")]
    EncryptionExpected,

    /// Varint ran past its maximum encodable width.
    #[error("varint overflow: more than {max_bytes} bytes")]
    VarintOverflow { max_bytes: usize },

    /// Declared length is inconsistent with the protocol limits.
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    /// Decrypted record's declared payload length disagrees with its size.
    #[error("bad message length: declared {declared}, got {got}")]
    BadLength { declared: usize, got: usize },
}

/// Result type alias for native API operations.
pub type Result<T> = std::result::Result<T, Error>;
