//! Protocol definitions for the ESPHome native API.
//!
//! This module contains the low-level protocol pieces:
//! - Varint encoding shared by framing and field codecs
//! - Minimal protobuf wire codec for session-control messages
//! - Message type identifiers and typed control messages
//! - Plaintext frame encoding/decoding
//! - Noise handshake and encrypted framing

pub mod frame;
pub mod message;
pub mod noise;
pub mod proto;
pub mod varint;

pub use frame::{MAX_FRAME_SIZE, NOISE_INDICATOR, PLAINTEXT_INDICATOR, PlaintextCodec};
pub use message::{
    BluetoothDeviceRequest, BluetoothDeviceRequestType, BluetoothGattGetServicesRequest,
    CameraImageRequest, ConnectRequest, ConnectResponse, GetTimeResponse, HelloRequest,
    HelloResponse, LIST_ENTITIES_RESPONSES, MessageType, ProtoMessage, RawBleAdvertisement,
    SubscribeLogsRequest, parse_raw_advertisements,
};
pub use noise::{HandshakePhase, HandshakeStep, NoiseCipher, NoiseCodec, NoiseHandshake};
