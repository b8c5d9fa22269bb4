//! Message type identifiers and session-control messages.
//!
//! Every frame carries a numeric message type identifier. The closed set of
//! identifiers the library understands is [`MessageType`]; the payload
//! schemas for most of them live in the externally supplied protocol
//! definition and travel through this crate as opaque bytes. The handful of
//! messages the connection itself must encode or decode (hello, connect,
//! ping, time, raw advertisements) have typed structs here.

use bytes::Bytes;

use crate::error::Result;
use crate::protocol::proto::{ProtoFields, ProtoWriter};

/// Known native API message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    /// Client hello, first message of every session.
    HelloRequest = 1,
    /// Server hello with protocol version and identity.
    HelloResponse = 2,
    /// Legacy password authentication request.
    ConnectRequest = 3,
    /// Authentication result.
    ConnectResponse = 4,
    /// Orderly session teardown request.
    DisconnectRequest = 5,
    /// Teardown acknowledgment.
    DisconnectResponse = 6,
    /// Keepalive probe.
    PingRequest = 7,
    /// Keepalive reply.
    PingResponse = 8,
    /// Device metadata query.
    DeviceInfoRequest = 9,
    /// Device metadata.
    DeviceInfoResponse = 10,
    /// Begin entity listing.
    ListEntitiesRequest = 11,
    /// Binary sensor entity description.
    ListEntitiesBinarySensorResponse = 12,
    /// Cover entity description.
    ListEntitiesCoverResponse = 13,
    /// Fan entity description.
    ListEntitiesFanResponse = 14,
    /// Light entity description.
    ListEntitiesLightResponse = 15,
    /// Sensor entity description.
    ListEntitiesSensorResponse = 16,
    /// Switch entity description.
    ListEntitiesSwitchResponse = 17,
    /// Text sensor entity description.
    ListEntitiesTextSensorResponse = 18,
    /// Terminates an entity listing.
    ListEntitiesDoneResponse = 19,
    /// Subscribe to entity state changes.
    SubscribeStatesRequest = 20,
    /// Binary sensor state.
    BinarySensorStateResponse = 21,
    /// Cover state.
    CoverStateResponse = 22,
    /// Fan state.
    FanStateResponse = 23,
    /// Light state.
    LightStateResponse = 24,
    /// Sensor state.
    SensorStateResponse = 25,
    /// Switch state.
    SwitchStateResponse = 26,
    /// Text sensor state.
    TextSensorStateResponse = 27,
    /// Subscribe to device log output.
    SubscribeLogsRequest = 28,
    /// Log line.
    SubscribeLogsResponse = 29,
    /// Cover command.
    CoverCommandRequest = 30,
    /// Fan command.
    FanCommandRequest = 31,
    /// Light command.
    LightCommandRequest = 32,
    /// Switch command.
    SwitchCommandRequest = 33,
    /// Device time query (peer-initiated).
    GetTimeRequest = 36,
    /// Device time reply.
    GetTimeResponse = 37,
    /// Camera image frame.
    CameraImageResponse = 45,
    /// Camera image request.
    CameraImageRequest = 46,
    /// Climate entity description.
    ListEntitiesClimateResponse = 47,
    /// Climate state.
    ClimateStateResponse = 48,
    /// Climate command.
    ClimateCommandRequest = 49,
    /// Number entity description.
    ListEntitiesNumberResponse = 50,
    /// Number state.
    NumberStateResponse = 51,
    /// Number command.
    NumberCommandRequest = 52,
    /// Select entity description.
    ListEntitiesSelectResponse = 53,
    /// Select state.
    SelectStateResponse = 54,
    /// Select command.
    SelectCommandRequest = 55,
    /// Siren entity description.
    ListEntitiesSirenResponse = 56,
    /// Siren state.
    SirenStateResponse = 57,
    /// Siren command.
    SirenCommandRequest = 58,
    /// Lock entity description.
    ListEntitiesLockResponse = 59,
    /// Lock state.
    LockStateResponse = 60,
    /// Lock command.
    LockCommandRequest = 61,
    /// Button entity description.
    ListEntitiesButtonResponse = 62,
    /// Button press command.
    ButtonCommandRequest = 63,
    /// Media player entity description.
    ListEntitiesMediaPlayerResponse = 64,
    /// Media player state.
    MediaPlayerStateResponse = 65,
    /// Media player command.
    MediaPlayerCommandRequest = 66,
    /// Subscribe to decoded BLE advertisements.
    SubscribeBluetoothLEAdvertisementsRequest = 67,
    /// Decoded BLE advertisement.
    BluetoothLEAdvertisementResponse = 68,
    /// BLE device operation (connect/pair/unpair/clear cache).
    BluetoothDeviceRequest = 69,
    /// BLE device connection state.
    BluetoothDeviceConnectionResponse = 70,
    /// Begin GATT service listing.
    BluetoothGATTGetServicesRequest = 71,
    /// GATT service description.
    BluetoothGATTGetServicesResponse = 72,
    /// Terminates a GATT service listing.
    BluetoothGATTGetServicesDoneResponse = 73,
    /// BLE pairing result.
    BluetoothDevicePairingResponse = 86,
    /// BLE unpairing result.
    BluetoothDeviceUnpairingResponse = 87,
    /// Stop BLE advertisement delivery.
    UnsubscribeBluetoothLEAdvertisementsRequest = 88,
    /// BLE cache clear result.
    BluetoothDeviceClearCacheResponse = 89,
    /// Batch of raw BLE advertisement records.
    BluetoothLERawAdvertisementsResponse = 93,
    /// Text entity description.
    ListEntitiesTextResponse = 97,
    /// Text state.
    TextStateResponse = 98,
    /// Text command.
    TextCommandRequest = 99,
}

/// Response kinds that carry one entity description during a listing call.
pub const LIST_ENTITIES_RESPONSES: &[MessageType] = &[
    MessageType::ListEntitiesBinarySensorResponse,
    MessageType::ListEntitiesCoverResponse,
    MessageType::ListEntitiesFanResponse,
    MessageType::ListEntitiesLightResponse,
    MessageType::ListEntitiesSensorResponse,
    MessageType::ListEntitiesSwitchResponse,
    MessageType::ListEntitiesTextSensorResponse,
    MessageType::ListEntitiesClimateResponse,
    MessageType::ListEntitiesNumberResponse,
    MessageType::ListEntitiesSelectResponse,
    MessageType::ListEntitiesSirenResponse,
    MessageType::ListEntitiesLockResponse,
    MessageType::ListEntitiesButtonResponse,
    MessageType::ListEntitiesMediaPlayerResponse,
    MessageType::ListEntitiesTextResponse,
];

impl MessageType {
    /// Attempts to resolve a numeric identifier.
    #[must_use]
    pub const fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(Self::HelloRequest),
            2 => Some(Self::HelloResponse),
            3 => Some(Self::ConnectRequest),
            4 => Some(Self::ConnectResponse),
            5 => Some(Self::DisconnectRequest),
            6 => Some(Self::DisconnectResponse),
            7 => Some(Self::PingRequest),
            8 => Some(Self::PingResponse),
            9 => Some(Self::DeviceInfoRequest),
            10 => Some(Self::DeviceInfoResponse),
            11 => Some(Self::ListEntitiesRequest),
            12 => Some(Self::ListEntitiesBinarySensorResponse),
            13 => Some(Self::ListEntitiesCoverResponse),
            14 => Some(Self::ListEntitiesFanResponse),
            15 => Some(Self::ListEntitiesLightResponse),
            16 => Some(Self::ListEntitiesSensorResponse),
            17 => Some(Self::ListEntitiesSwitchResponse),
            18 => Some(Self::ListEntitiesTextSensorResponse),
            19 => Some(Self::ListEntitiesDoneResponse),
            20 => Some(Self::SubscribeStatesRequest),
            21 => Some(Self::BinarySensorStateResponse),
            22 => Some(Self::CoverStateResponse),
            23 => Some(Self::FanStateResponse),
            24 => Some(Self::LightStateResponse),
            25 => Some(Self::SensorStateResponse),
            26 => Some(Self::SwitchStateResponse),
            27 => Some(Self::TextSensorStateResponse),
            28 => Some(Self::SubscribeLogsRequest),
            29 => Some(Self::SubscribeLogsResponse),
            30 => Some(Self::CoverCommandRequest),
            31 => Some(Self::FanCommandRequest),
            32 => Some(Self::LightCommandRequest),
            33 => Some(Self::SwitchCommandRequest),
            36 => Some(Self::GetTimeRequest),
            37 => Some(Self::GetTimeResponse),
            45 => Some(Self::CameraImageResponse),
            46 => Some(Self::CameraImageRequest),
            47 => Some(Self::ListEntitiesClimateResponse),
            48 => Some(Self::ClimateStateResponse),
            49 => Some(Self::ClimateCommandRequest),
            50 => Some(Self::ListEntitiesNumberResponse),
            51 => Some(Self::NumberStateResponse),
            52 => Some(Self::NumberCommandRequest),
            53 => Some(Self::ListEntitiesSelectResponse),
            54 => Some(Self::SelectStateResponse),
            55 => Some(Self::SelectCommandRequest),
            56 => Some(Self::ListEntitiesSirenResponse),
            57 => Some(Self::SirenStateResponse),
            58 => Some(Self::SirenCommandRequest),
            59 => Some(Self::ListEntitiesLockResponse),
            60 => Some(Self::LockStateResponse),
            61 => Some(Self::LockCommandRequest),
            62 => Some(Self::ListEntitiesButtonResponse),
            63 => Some(Self::ButtonCommandRequest),
            64 => Some(Self::ListEntitiesMediaPlayerResponse),
            65 => Some(Self::MediaPlayerStateResponse),
            66 => Some(Self::MediaPlayerCommandRequest),
            67 => Some(Self::SubscribeBluetoothLEAdvertisementsRequest),
            68 => Some(Self::BluetoothLEAdvertisementResponse),
            69 => Some(Self::BluetoothDeviceRequest),
            70 => Some(Self::BluetoothDeviceConnectionResponse),
            71 => Some(Self::BluetoothGATTGetServicesRequest),
            72 => Some(Self::BluetoothGATTGetServicesResponse),
            73 => Some(Self::BluetoothGATTGetServicesDoneResponse),
            86 => Some(Self::BluetoothDevicePairingResponse),
            87 => Some(Self::BluetoothDeviceUnpairingResponse),
            88 => Some(Self::UnsubscribeBluetoothLEAdvertisementsRequest),
            89 => Some(Self::BluetoothDeviceClearCacheResponse),
            93 => Some(Self::BluetoothLERawAdvertisementsResponse),
            97 => Some(Self::ListEntitiesTextResponse),
            98 => Some(Self::TextStateResponse),
            99 => Some(Self::TextCommandRequest),
            _ => None,
        }
    }

    /// Numeric wire identifier.
    #[must_use]
    pub const fn id(self) -> u32 {
        self as u32
    }
}

/// One decoded wire message: a numeric type identifier plus its payload.
///
/// Payloads stay opaque at this layer; callers resolve them against the
/// external schema registry, and the connection decodes the few it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtoMessage {
    /// Numeric message type identifier.
    pub type_id: u32,
    /// Encoded protobuf payload.
    pub payload: Bytes,
}

impl ProtoMessage {
    /// Builds a message from a known type and payload.
    #[must_use]
    pub fn new(message_type: MessageType, payload: Bytes) -> Self {
        Self {
            type_id: message_type.id(),
            payload,
        }
    }

    /// Builds a message with an empty payload.
    #[must_use]
    pub fn empty(message_type: MessageType) -> Self {
        Self::new(message_type, Bytes::new())
    }

    /// Resolves the type identifier against the known set.
    #[must_use]
    pub const fn message_type(&self) -> Option<MessageType> {
        MessageType::from_id(self.type_id)
    }
}

/// Client hello carrying the client identifier string.
#[derive(Debug, Clone)]
pub struct HelloRequest {
    /// Free-form client identifier, shown in device logs.
    pub client_info: String,
}

impl HelloRequest {
    /// Encodes to a wire message.
    #[must_use]
    pub fn encode(&self) -> ProtoMessage {
        let mut w = ProtoWriter::new();
        if !self.client_info.is_empty() {
            w.string(1, &self.client_info);
        }
        ProtoMessage::new(MessageType::HelloRequest, w.finish())
    }
}

/// Server hello with the peer's protocol version and identity.
#[derive(Debug, Clone, Default)]
pub struct HelloResponse {
    /// Major protocol version.
    pub api_version_major: u32,
    /// Minor protocol version; decides whether legacy auth is needed.
    pub api_version_minor: u32,
    /// Server implementation and version string.
    pub server_info: String,
    /// Device node name.
    pub name: String,
}

impl HelloResponse {
    /// Parses from an encoded payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid protobuf.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        for field in ProtoFields::new(payload) {
            let (number, value) = field?;
            match number {
                1 => out.api_version_major = value.as_u64() as u32,
                2 => out.api_version_minor = value.as_u64() as u32,
                3 => out.server_info = value.as_str_lossy(),
                4 => out.name = value.as_str_lossy(),
                _ => {}
            }
        }
        Ok(out)
    }
}

/// Legacy password authentication.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Device API password; may be empty for unprotected devices.
    pub password: String,
}

impl ConnectRequest {
    /// Encodes to a wire message.
    #[must_use]
    pub fn encode(&self) -> ProtoMessage {
        let mut w = ProtoWriter::new();
        if !self.password.is_empty() {
            w.string(1, &self.password);
        }
        ProtoMessage::new(MessageType::ConnectRequest, w.finish())
    }
}

/// Authentication result.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectResponse {
    /// Set when the peer rejected the supplied password.
    pub invalid_password: bool,
}

impl ConnectResponse {
    /// Parses from an encoded payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid protobuf.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        for field in ProtoFields::new(payload) {
            let (number, value) = field?;
            if number == 1 {
                out.invalid_password = value.as_bool();
            }
        }
        Ok(out)
    }
}

/// Device time reply; also sent by us when the peer asks for the time.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetTimeResponse {
    /// Seconds since the Unix epoch.
    pub epoch_seconds: u32,
}

impl GetTimeResponse {
    /// Encodes to a wire message.
    #[must_use]
    pub fn encode(&self) -> ProtoMessage {
        let mut w = ProtoWriter::new();
        w.fixed32(1, self.epoch_seconds);
        ProtoMessage::new(MessageType::GetTimeResponse, w.finish())
    }

    /// Parses from an encoded payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid protobuf.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        for field in ProtoFields::new(payload) {
            let (number, value) = field?;
            if number == 1 {
                out.epoch_seconds = value.as_u64() as u32;
            }
        }
        Ok(out)
    }
}

/// Log subscription request.
#[derive(Debug, Clone, Copy)]
pub struct SubscribeLogsRequest {
    /// Requested log level (protocol enum value).
    pub level: u32,
    /// Ask the device to dump its configuration once.
    pub dump_config: bool,
}

impl SubscribeLogsRequest {
    /// Encodes to a wire message.
    #[must_use]
    pub fn encode(&self) -> ProtoMessage {
        let mut w = ProtoWriter::new();
        if self.level != 0 {
            w.varint(1, u64::from(self.level));
        }
        if self.dump_config {
            w.bool(2, true);
        }
        ProtoMessage::new(MessageType::SubscribeLogsRequest, w.finish())
    }
}

/// Camera frame request.
#[derive(Debug, Clone, Copy)]
pub struct CameraImageRequest {
    /// Request a single frame.
    pub single: bool,
    /// Request a frame stream.
    pub stream: bool,
}

impl CameraImageRequest {
    /// Encodes to a wire message.
    #[must_use]
    pub fn encode(&self) -> ProtoMessage {
        let mut w = ProtoWriter::new();
        if self.single {
            w.bool(1, true);
        }
        if self.stream {
            w.bool(2, true);
        }
        ProtoMessage::new(MessageType::CameraImageRequest, w.finish())
    }
}

/// BLE device operations carried by [`BluetoothDeviceRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BluetoothDeviceRequestType {
    /// Open a connection to the device.
    Connect = 0,
    /// Drop the connection.
    Disconnect = 1,
    /// Pair with the device.
    Pair = 2,
    /// Remove the pairing.
    Unpair = 3,
    /// Clear the cached GATT database.
    ClearCache = 4,
}

/// BLE device operation request.
#[derive(Debug, Clone, Copy)]
pub struct BluetoothDeviceRequest {
    /// 48-bit device address.
    pub address: u64,
    /// Requested operation.
    pub request_type: BluetoothDeviceRequestType,
}

impl BluetoothDeviceRequest {
    /// Encodes to a wire message.
    #[must_use]
    pub fn encode(&self) -> ProtoMessage {
        let mut w = ProtoWriter::new();
        w.varint(1, self.address);
        if self.request_type as u8 != 0 {
            w.varint(2, u64::from(self.request_type as u8));
        }
        ProtoMessage::new(MessageType::BluetoothDeviceRequest, w.finish())
    }
}

/// GATT service listing request.
#[derive(Debug, Clone, Copy)]
pub struct BluetoothGattGetServicesRequest {
    /// 48-bit device address.
    pub address: u64,
}

impl BluetoothGattGetServicesRequest {
    /// Encodes to a wire message.
    #[must_use]
    pub fn encode(&self) -> ProtoMessage {
        let mut w = ProtoWriter::new();
        w.varint(1, self.address);
        ProtoMessage::new(MessageType::BluetoothGATTGetServicesRequest, w.finish())
    }
}

/// One entry of a raw BLE advertisement batch.
#[derive(Debug, Clone, Default)]
pub struct RawBleAdvertisement {
    /// 48-bit advertiser address.
    pub address: u64,
    /// Received signal strength in dBm.
    pub rssi: i32,
    /// Public/random address type.
    pub address_type: u32,
    /// Packed AD structures as captured over the air.
    pub data: Bytes,
}

/// Parses a `BluetoothLERawAdvertisementsResponse` batch payload.
///
/// # Errors
///
/// Returns an error if the payload is not valid protobuf.
pub fn parse_raw_advertisements(payload: &[u8]) -> Result<Vec<RawBleAdvertisement>> {
    let mut out = Vec::new();
    for field in ProtoFields::new(payload) {
        let (number, value) = field?;
        if number != 1 {
            continue;
        }
        let mut adv = RawBleAdvertisement::default();
        for inner in ProtoFields::new(value.as_bytes()) {
            let (inner_number, inner_value) = inner?;
            match inner_number {
                1 => adv.address = inner_value.as_u64(),
                2 => adv.rssi = inner_value.as_sint32(),
                3 => adv.address_type = inner_value.as_u64() as u32,
                4 => adv.data = Bytes::copy_from_slice(inner_value.as_bytes()),
                _ => {}
            }
        }
        out.push(adv);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        assert_eq!(MessageType::from_id(1), Some(MessageType::HelloRequest));
        assert_eq!(
            MessageType::from_id(93),
            Some(MessageType::BluetoothLERawAdvertisementsResponse)
        );
        assert_eq!(MessageType::from_id(1234), None);
        assert_eq!(MessageType::ListEntitiesDoneResponse.id(), 19);
    }

    #[test]
    fn test_hello_roundtrip() {
        let msg = HelloRequest {
            client_info: "esphome-native-api 0.1.0".into(),
        }
        .encode();
        assert_eq!(msg.message_type(), Some(MessageType::HelloRequest));

        let mut w = ProtoWriter::new();
        w.varint(1, 1);
        w.varint(2, 9);
        w.string(3, "ESPHome v2023.6.0");
        w.string(4, "kitchen");
        let hello = HelloResponse::parse(&w.finish()).unwrap();
        assert_eq!(hello.api_version_major, 1);
        assert_eq!(hello.api_version_minor, 9);
        assert_eq!(hello.name, "kitchen");
    }

    #[test]
    fn test_connect_response_invalid_password() {
        let mut w = ProtoWriter::new();
        w.bool(1, true);
        let resp = ConnectResponse::parse(&w.finish()).unwrap();
        assert!(resp.invalid_password);

        let resp = ConnectResponse::parse(&[]).unwrap();
        assert!(!resp.invalid_password);
    }

    #[test]
    fn test_get_time_uses_fixed32() {
        let msg = GetTimeResponse {
            epoch_seconds: 1_700_000_000,
        }
        .encode();
        // tag (field 1, wire type 5) + 4 byte little-endian seconds
        assert_eq!(msg.payload[0], 0x0D);
        assert_eq!(
            &msg.payload[1..5],
            1_700_000_000_u32.to_le_bytes().as_slice()
        );
        let parsed = GetTimeResponse::parse(&msg.payload).unwrap();
        assert_eq!(parsed.epoch_seconds, 1_700_000_000);
    }

    #[test]
    fn test_parse_raw_advertisements() {
        let mut entry = ProtoWriter::new();
        entry.varint(1, 0x0011_2233_4455);
        entry.varint(2, 131); // zigzag for -66
        entry.varint(3, 1);
        entry.bytes(4, &[0x02, 0x01, 0x06]);
        let entry = entry.finish();

        let mut batch = ProtoWriter::new();
        batch.bytes(1, &entry);
        batch.bytes(1, &entry);

        let advs = parse_raw_advertisements(&batch.finish()).unwrap();
        assert_eq!(advs.len(), 2);
        assert_eq!(advs[0].address, 0x0011_2233_4455);
        assert_eq!(advs[0].rssi, -66);
        assert_eq!(advs[0].address_type, 1);
        assert_eq!(advs[0].data.as_ref(), &[0x02, 0x01, 0x06]);
    }
}
