//! Transport layer for device communication.
//!
//! This module provides the abstraction over the two wire formats a device
//! can speak: plaintext frames and Noise-encrypted frames. Both deliver the
//! same message stream, so everything above this layer is format agnostic.

pub mod noise;
pub mod plaintext;

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::ProtoMessage;

/// An item produced by a transport's background read loop.
#[derive(Debug)]
pub enum FrameEvent {
    /// A complete decoded message.
    Message(ProtoMessage),
    /// A fatal transport error. The connection is unusable afterwards.
    Error(String),
    /// The peer closed the connection.
    Closed,
}

/// Trait for framed transport implementations.
///
/// `connect` resolves only once the transport is ready to carry messages.
/// For encrypted transports that includes the full handshake.
pub trait FrameTransport: Send + Sync {
    /// Connects to the device.
    fn connect(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Disconnects from the device.
    fn disconnect(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Sends a message to the device.
    fn send_message(
        &mut self,
        message: ProtoMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Returns true if connected.
    fn is_connected(&self) -> bool;

    /// Takes the event receiver for use by a processing task.
    ///
    /// This can only be called once after connecting.
    fn take_events(&mut self) -> Option<mpsc::Receiver<FrameEvent>>;
}

pub use noise::NoiseTransport;
pub use plaintext::PlaintextTransport;
