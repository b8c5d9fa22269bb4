//! Typed command encoders for entity control.
//!
//! Each command is a struct of optional intents keyed by the entity's
//! 32-bit key. Unset fields are simply left out of the encoded message, so
//! the device only changes what the caller asked for. The matching `has_*`
//! marker is written alongside each optional field that carries one in the
//! wire schema.

use crate::protocol::ProtoMessage;
use crate::protocol::message::MessageType;
use crate::protocol::proto::ProtoWriter;

/// Turns a light on or off and adjusts its output.
#[derive(Debug, Clone, Default)]
pub struct LightCommand {
    /// Entity key.
    pub key: u32,
    /// On/off state.
    pub state: Option<bool>,
    /// Master brightness, 0.0 to 1.0.
    pub brightness: Option<f32>,
    /// RGB channel values, each 0.0 to 1.0.
    pub rgb: Option<(f32, f32, f32)>,
    /// White channel value, 0.0 to 1.0.
    pub white: Option<f32>,
    /// Color temperature in mireds.
    pub color_temperature: Option<f32>,
    /// Fade duration in milliseconds.
    pub transition_length: Option<u32>,
    /// Flash duration in milliseconds.
    pub flash_length: Option<u32>,
    /// Named effect to activate.
    pub effect: Option<String>,
}

impl LightCommand {
    /// Creates a command addressing the given entity.
    #[must_use]
    pub fn new(key: u32) -> Self {
        Self {
            key,
            ..Self::default()
        }
    }

    /// Encodes the command message.
    #[must_use]
    pub fn encode(&self) -> ProtoMessage {
        let mut w = ProtoWriter::new();
        w.fixed32(1, self.key);
        if let Some(state) = self.state {
            w.bool(2, true);
            w.bool(3, state);
        }
        if let Some(brightness) = self.brightness {
            w.bool(4, true);
            w.float(5, brightness);
        }
        if let Some((red, green, blue)) = self.rgb {
            w.bool(6, true);
            w.float(7, red);
            w.float(8, green);
            w.float(9, blue);
        }
        if let Some(white) = self.white {
            w.bool(10, true);
            w.float(11, white);
        }
        if let Some(color_temperature) = self.color_temperature {
            w.bool(12, true);
            w.float(13, color_temperature);
        }
        if let Some(transition_length) = self.transition_length {
            w.bool(14, true);
            w.varint(15, u64::from(transition_length));
        }
        if let Some(flash_length) = self.flash_length {
            w.bool(16, true);
            w.varint(17, u64::from(flash_length));
        }
        if let Some(effect) = &self.effect {
            w.bool(18, true);
            w.string(19, effect);
        }
        ProtoMessage::new(MessageType::LightCommandRequest, w.finish())
    }
}

/// Sets a switch on or off.
#[derive(Debug, Clone)]
pub struct SwitchCommand {
    /// Entity key.
    pub key: u32,
    /// Target state.
    pub state: bool,
}

impl SwitchCommand {
    /// Encodes the command message.
    #[must_use]
    pub fn encode(&self) -> ProtoMessage {
        let mut w = ProtoWriter::new();
        w.fixed32(1, self.key);
        w.bool(2, self.state);
        ProtoMessage::new(MessageType::SwitchCommandRequest, w.finish())
    }
}

/// Moves a cover to a position or tilt, or stops it.
#[derive(Debug, Clone, Default)]
pub struct CoverCommand {
    /// Entity key.
    pub key: u32,
    /// Target position, 0.0 (closed) to 1.0 (open).
    pub position: Option<f32>,
    /// Target tilt, 0.0 to 1.0.
    pub tilt: Option<f32>,
    /// Stop movement immediately.
    pub stop: bool,
}

impl CoverCommand {
    /// Creates a command addressing the given entity.
    #[must_use]
    pub fn new(key: u32) -> Self {
        Self {
            key,
            ..Self::default()
        }
    }

    /// Encodes the command message.
    #[must_use]
    pub fn encode(&self) -> ProtoMessage {
        let mut w = ProtoWriter::new();
        w.fixed32(1, self.key);
        if let Some(position) = self.position {
            w.bool(4, true);
            w.float(5, position);
        }
        if let Some(tilt) = self.tilt {
            w.bool(6, true);
            w.float(7, tilt);
        }
        if self.stop {
            w.bool(8, true);
        }
        ProtoMessage::new(MessageType::CoverCommandRequest, w.finish())
    }
}

/// Controls a fan's state, speed and motion.
#[derive(Debug, Clone, Default)]
pub struct FanCommand {
    /// Entity key.
    pub key: u32,
    /// On/off state.
    pub state: Option<bool>,
    /// Oscillation on/off.
    pub oscillating: Option<bool>,
    /// Rotation direction, 0 forward, 1 reverse.
    pub direction: Option<u32>,
    /// Discrete speed level, 1 up to the entity's advertised maximum.
    pub speed_level: Option<i32>,
}

impl FanCommand {
    /// Creates a command addressing the given entity.
    #[must_use]
    pub fn new(key: u32) -> Self {
        Self {
            key,
            ..Self::default()
        }
    }

    /// Encodes the command message.
    #[must_use]
    pub fn encode(&self) -> ProtoMessage {
        let mut w = ProtoWriter::new();
        w.fixed32(1, self.key);
        if let Some(state) = self.state {
            w.bool(2, true);
            w.bool(3, state);
        }
        if let Some(oscillating) = self.oscillating {
            w.bool(6, true);
            w.bool(7, oscillating);
        }
        if let Some(direction) = self.direction {
            w.bool(8, true);
            w.varint(9, u64::from(direction));
        }
        if let Some(speed_level) = self.speed_level {
            w.bool(10, true);
            w.varint(11, speed_level as u64);
        }
        ProtoMessage::new(MessageType::FanCommandRequest, w.finish())
    }
}

/// Sets a climate device's mode and temperature targets.
#[derive(Debug, Clone, Default)]
pub struct ClimateCommand {
    /// Entity key.
    pub key: u32,
    /// Operating mode (off, heat/cool, cool, heat, ...).
    pub mode: Option<u32>,
    /// Single setpoint in degrees.
    pub target_temperature: Option<f32>,
    /// Lower setpoint for dual-point devices.
    pub target_temperature_low: Option<f32>,
    /// Upper setpoint for dual-point devices.
    pub target_temperature_high: Option<f32>,
    /// Fan mode.
    pub fan_mode: Option<u32>,
    /// Swing mode.
    pub swing_mode: Option<u32>,
    /// Preset.
    pub preset: Option<u32>,
}

impl ClimateCommand {
    /// Creates a command addressing the given entity.
    #[must_use]
    pub fn new(key: u32) -> Self {
        Self {
            key,
            ..Self::default()
        }
    }

    /// Encodes the command message.
    #[must_use]
    pub fn encode(&self) -> ProtoMessage {
        let mut w = ProtoWriter::new();
        w.fixed32(1, self.key);
        if let Some(mode) = self.mode {
            w.bool(2, true);
            w.varint(3, u64::from(mode));
        }
        if let Some(target) = self.target_temperature {
            w.bool(4, true);
            w.float(5, target);
        }
        if let Some(low) = self.target_temperature_low {
            w.bool(6, true);
            w.float(7, low);
        }
        if let Some(high) = self.target_temperature_high {
            w.bool(8, true);
            w.float(9, high);
        }
        if let Some(fan_mode) = self.fan_mode {
            w.bool(12, true);
            w.varint(13, u64::from(fan_mode));
        }
        if let Some(swing_mode) = self.swing_mode {
            w.bool(14, true);
            w.varint(15, u64::from(swing_mode));
        }
        if let Some(preset) = self.preset {
            w.bool(18, true);
            w.varint(19, u64::from(preset));
        }
        ProtoMessage::new(MessageType::ClimateCommandRequest, w.finish())
    }
}

/// Sets a numeric entity's value.
#[derive(Debug, Clone)]
pub struct NumberCommand {
    /// Entity key.
    pub key: u32,
    /// New value.
    pub state: f32,
}

impl NumberCommand {
    /// Encodes the command message.
    #[must_use]
    pub fn encode(&self) -> ProtoMessage {
        let mut w = ProtoWriter::new();
        w.fixed32(1, self.key);
        w.float(2, self.state);
        ProtoMessage::new(MessageType::NumberCommandRequest, w.finish())
    }
}

/// Picks an option on a select entity.
#[derive(Debug, Clone)]
pub struct SelectCommand {
    /// Entity key.
    pub key: u32,
    /// Option to select, one of the entity's advertised options.
    pub state: String,
}

impl SelectCommand {
    /// Encodes the command message.
    #[must_use]
    pub fn encode(&self) -> ProtoMessage {
        let mut w = ProtoWriter::new();
        w.fixed32(1, self.key);
        w.string(2, &self.state);
        ProtoMessage::new(MessageType::SelectCommandRequest, w.finish())
    }
}

/// Starts or stops a siren.
#[derive(Debug, Clone, Default)]
pub struct SirenCommand {
    /// Entity key.
    pub key: u32,
    /// On/off state.
    pub state: Option<bool>,
    /// Tone name.
    pub tone: Option<String>,
    /// Duration in milliseconds.
    pub duration: Option<u32>,
    /// Volume, 0.0 to 1.0.
    pub volume: Option<f32>,
}

impl SirenCommand {
    /// Creates a command addressing the given entity.
    #[must_use]
    pub fn new(key: u32) -> Self {
        Self {
            key,
            ..Self::default()
        }
    }

    /// Encodes the command message.
    #[must_use]
    pub fn encode(&self) -> ProtoMessage {
        let mut w = ProtoWriter::new();
        w.fixed32(1, self.key);
        if let Some(state) = self.state {
            w.bool(2, true);
            w.bool(3, state);
        }
        if let Some(tone) = &self.tone {
            w.bool(4, true);
            w.string(5, tone);
        }
        if let Some(duration) = self.duration {
            w.bool(6, true);
            w.varint(7, u64::from(duration));
        }
        if let Some(volume) = self.volume {
            w.bool(8, true);
            w.float(9, volume);
        }
        ProtoMessage::new(MessageType::SirenCommandRequest, w.finish())
    }
}

/// Lock operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LockOperation {
    /// Unlock the lock.
    Unlock = 0,
    /// Lock the lock.
    Lock = 1,
    /// Open (e.g. a door latch), where supported.
    Open = 2,
}

/// Locks, unlocks or opens a lock entity.
#[derive(Debug, Clone)]
pub struct LockCommand {
    /// Entity key.
    pub key: u32,
    /// Operation to perform.
    pub operation: LockOperation,
    /// Unlock code, if the entity requires one.
    pub code: Option<String>,
}

impl LockCommand {
    /// Encodes the command message.
    #[must_use]
    pub fn encode(&self) -> ProtoMessage {
        let mut w = ProtoWriter::new();
        w.fixed32(1, self.key);
        w.varint(2, u64::from(self.operation as u32));
        if let Some(code) = &self.code {
            w.bool(3, true);
            w.string(4, code);
        }
        ProtoMessage::new(MessageType::LockCommandRequest, w.finish())
    }
}

/// Presses a button entity.
#[derive(Debug, Clone)]
pub struct ButtonCommand {
    /// Entity key.
    pub key: u32,
}

impl ButtonCommand {
    /// Encodes the command message.
    #[must_use]
    pub fn encode(&self) -> ProtoMessage {
        let mut w = ProtoWriter::new();
        w.fixed32(1, self.key);
        ProtoMessage::new(MessageType::ButtonCommandRequest, w.finish())
    }
}

/// Media player transport operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MediaPlayerOperation {
    /// Start or resume playback.
    Play = 1,
    /// Pause playback.
    Pause = 2,
    /// Stop playback.
    Stop = 3,
    /// Mute output.
    Mute = 4,
    /// Unmute output.
    Unmute = 5,
}

/// Controls a media player entity.
#[derive(Debug, Clone, Default)]
pub struct MediaPlayerCommand {
    /// Entity key.
    pub key: u32,
    /// Transport operation.
    pub command: Option<MediaPlayerOperation>,
    /// Volume, 0.0 to 1.0.
    pub volume: Option<f32>,
    /// Media URL to play.
    pub media_url: Option<String>,
}

impl MediaPlayerCommand {
    /// Creates a command addressing the given entity.
    #[must_use]
    pub fn new(key: u32) -> Self {
        Self {
            key,
            ..Self::default()
        }
    }

    /// Encodes the command message.
    #[must_use]
    pub fn encode(&self) -> ProtoMessage {
        let mut w = ProtoWriter::new();
        w.fixed32(1, self.key);
        if let Some(command) = self.command {
            w.bool(2, true);
            w.varint(3, u64::from(command as u32));
        }
        if let Some(volume) = self.volume {
            w.bool(4, true);
            w.float(5, volume);
        }
        if let Some(media_url) = &self.media_url {
            w.bool(6, true);
            w.string(7, media_url);
        }
        ProtoMessage::new(MessageType::MediaPlayerCommandRequest, w.finish())
    }
}

/// Sets a text entity's value.
#[derive(Debug, Clone)]
pub struct TextCommand {
    /// Entity key.
    pub key: u32,
    /// New text value.
    pub state: String,
}

impl TextCommand {
    /// Encodes the command message.
    #[must_use]
    pub fn encode(&self) -> ProtoMessage {
        let mut w = ProtoWriter::new();
        w.fixed32(1, self.key);
        w.string(2, &self.state);
        ProtoMessage::new(MessageType::TextCommandRequest, w.finish())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::protocol::proto::{ProtoFields, ProtoValue};

    fn fields(payload: &Bytes) -> Vec<(u32, u64)> {
        ProtoFields::new(payload)
            .map(|r| {
                let (field, value) = r.unwrap();
                let raw = match value {
                    ProtoValue::Varint(v) => v,
                    ProtoValue::Fixed32(v) => u64::from(v),
                    ProtoValue::Fixed64(v) => v,
                    ProtoValue::Bytes(b) => b.len() as u64,
                };
                (field, raw)
            })
            .collect()
    }

    #[test]
    fn test_switch_command_layout() {
        let msg = SwitchCommand {
            key: 0xDEAD_BEEF,
            state: true,
        }
        .encode();
        assert_eq!(msg.message_type(), Some(MessageType::SwitchCommandRequest));
        assert_eq!(fields(&msg.payload), vec![(1, 0xDEAD_BEEF), (2, 1)]);
    }

    #[test]
    fn test_light_command_unset_fields_omitted() {
        let msg = LightCommand::new(7).encode();
        assert_eq!(fields(&msg.payload), vec![(1, 7)]);

        let msg = LightCommand {
            key: 7,
            state: Some(true),
            brightness: Some(0.5),
            ..LightCommand::default()
        }
        .encode();
        let encoded = fields(&msg.payload);
        assert_eq!(encoded[0], (1, 7));
        // has_state marker then state
        assert_eq!(encoded[1], (2, 1));
        assert_eq!(encoded[2], (3, 1));
        // has_brightness marker then the float bits
        assert_eq!(encoded[3], (4, 1));
        assert_eq!(encoded[4], (5, u64::from(0.5_f32.to_bits())));
    }

    #[test]
    fn test_light_effect_marker_pairs_with_name() {
        let msg = LightCommand {
            key: 1,
            effect: Some("rainbow".into()),
            ..LightCommand::default()
        }
        .encode();
        let encoded = fields(&msg.payload);
        assert_eq!(encoded, vec![(1, 1), (18, 1), (19, 7)]);
    }

    #[test]
    fn test_cover_stop_only_when_set() {
        let msg = CoverCommand::new(3).encode();
        assert_eq!(fields(&msg.payload), vec![(1, 3)]);

        let msg = CoverCommand {
            key: 3,
            stop: true,
            ..CoverCommand::default()
        }
        .encode();
        assert_eq!(fields(&msg.payload), vec![(1, 3), (8, 1)]);
    }

    #[test]
    fn test_button_command_is_key_only() {
        let msg = ButtonCommand { key: 11 }.encode();
        assert_eq!(msg.message_type(), Some(MessageType::ButtonCommandRequest));
        assert_eq!(fields(&msg.payload), vec![(1, 11)]);
    }

    #[test]
    fn test_lock_command_operation_and_code() {
        let msg = LockCommand {
            key: 5,
            operation: LockOperation::Unlock,
            code: Some("1234".into()),
        }
        .encode();
        assert_eq!(fields(&msg.payload), vec![(1, 5), (2, 0), (3, 1), (4, 4)]);
    }

    #[test]
    fn test_media_player_command() {
        let msg = MediaPlayerCommand {
            key: 9,
            command: Some(MediaPlayerOperation::Pause),
            volume: Some(1.0),
            media_url: None,
        }
        .encode();
        let encoded = fields(&msg.payload);
        assert_eq!(
            encoded,
            vec![(1, 9), (2, 1), (3, 2), (4, 1), (5, u64::from(1.0_f32.to_bits()))]
        );
    }

    #[test]
    fn test_text_command() {
        let msg = TextCommand {
            key: 2,
            state: "hello".into(),
        }
        .encode();
        assert_eq!(msg.message_type(), Some(MessageType::TextCommandRequest));
        assert_eq!(fields(&msg.payload), vec![(1, 2), (2, 5)]);
    }
}
