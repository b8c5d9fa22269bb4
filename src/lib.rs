//! # esphome-native-api
//!
//! A Rust client library for the ESPHome native API.
//!
//! This library speaks the device protocol on TCP port 6053: plaintext or
//! Noise-encrypted framing, session establishment with hello and optional
//! legacy authentication, correlated request/response calls, entity
//! commands and Bluetooth proxy support.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - Event-driven architecture for state updates and push messages
//! - Noise `NNpsk0` encryption with pre-shared keys
//! - Automatic keepalive and reconnection
//!
//! ## Quick Start
//!
//! ```no_run
//! use esphome_native_api::{Connection, ConnectionConfig, LightCommand};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), esphome_native_api::Error> {
//!     // Connect to a device without an encryption key
//!     let config = ConnectionConfig::new("kitchen.local");
//!     let conn = Connection::plaintext(config)?;
//!     conn.connect().await?;
//!
//!     // Enumerate the entities the device exposes
//!     for entity in conn.list_entities().await? {
//!         println!("entity message type {}", entity.type_id);
//!     }
//!
//!     // Turn a light on at half brightness
//!     let mut command = LightCommand::new(0xDEAD_BEEF);
//!     command.state = Some(true);
//!     command.brightness = Some(0.5);
//!     conn.light_command(&command).await?;
//!
//!     conn.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`protocol`] - Framing, varints, message types, Noise handshake
//! - [`transport`] - Plaintext and encrypted TCP transports
//! - [`event`] - Async event system for handling notifications
//! - [`advertisement`] - Bluetooth LE advertisement decoding
//! - [`commands`] - Typed entity command encoders
//! - [`connection`] - High-level [`Connection`] session

pub mod advertisement;
pub mod commands;
pub mod connection;
pub mod error;
pub mod event;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
pub use advertisement::{Advertisement, AdvertisementData};
pub use commands::{
    ButtonCommand, ClimateCommand, CoverCommand, FanCommand, LightCommand, LockCommand,
    LockOperation, MediaPlayerCommand, MediaPlayerOperation, NumberCommand, SelectCommand,
    SirenCommand, SwitchCommand, TextCommand,
};
pub use connection::{Connection, ConnectionConfig, ConnectionState};
pub use error::{Error, FrameError, Result};
pub use event::{Event, EventDispatcher, EventFilter, Subscription};
pub use protocol::{BluetoothDeviceRequestType, MessageType, ProtoMessage};
pub use transport::{FrameEvent, FrameTransport, NoiseTransport, PlaintextTransport};
