//! Bluetooth LE advertisement decoding.
//!
//! Raw advertisement batches carry the packed AD structures exactly as
//! captured over the air: a stream of `[length][type][value...]` records
//! where the length byte covers the type byte plus the value. This module
//! reconstructs the structured fields an application cares about.

use crate::protocol::message::RawBleAdvertisement;

// AD structure types (Bluetooth Assigned Numbers, "Common Data Types")
const AD_UUIDS_16_INCOMPLETE: u8 = 0x02;
const AD_UUIDS_16_COMPLETE: u8 = 0x03;
const AD_UUIDS_32_INCOMPLETE: u8 = 0x04;
const AD_UUIDS_32_COMPLETE: u8 = 0x05;
const AD_UUIDS_128_INCOMPLETE: u8 = 0x06;
const AD_UUIDS_128_COMPLETE: u8 = 0x07;
const AD_NAME_SHORT: u8 = 0x08;
const AD_NAME_COMPLETE: u8 = 0x09;
const AD_SERVICE_DATA_16: u8 = 0x16;
const AD_SERVICE_DATA_32: u8 = 0x20;
const AD_SERVICE_DATA_128: u8 = 0x21;
const AD_MANUFACTURER_DATA: u8 = 0xFF;

/// A `{uuid, bytes}` entry from service or manufacturer data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementData {
    /// Canonical 128-bit UUID string.
    pub uuid: String,
    /// Opaque data bytes following the UUID.
    pub data: Vec<u8>,
}

/// One decoded BLE advertisement.
#[derive(Debug, Clone, Default)]
pub struct Advertisement {
    /// 48-bit advertiser address.
    pub address: u64,
    /// Received signal strength in dBm.
    pub rssi: i32,
    /// Public/random address type.
    pub address_type: u32,
    /// Local name, if advertised. When both a shortened and a complete
    /// name appear the longer form wins.
    pub name: Option<String>,
    /// Advertised service UUIDs in canonical form.
    pub service_uuids: Vec<String>,
    /// Service data entries.
    pub service_data: Vec<AdvertisementData>,
    /// Manufacturer-specific data entries, keyed by company identifier.
    pub manufacturer_data: Vec<AdvertisementData>,
}

impl Advertisement {
    /// Decodes one raw batch entry into a structured advertisement.
    #[must_use]
    pub fn from_raw(raw: &RawBleAdvertisement) -> Self {
        let mut adv = Self {
            address: raw.address,
            rssi: raw.rssi,
            address_type: raw.address_type,
            ..Self::default()
        };
        adv.parse_ad_structures(&raw.data);
        adv
    }

    /// Walks the packed AD structures, dispatching by type byte.
    ///
    /// Unrecognized types are skipped for forward compatibility. A length
    /// byte pointing past the end of the record truncates that structure
    /// but never fails the whole advertisement.
    fn parse_ad_structures(&mut self, data: &[u8]) {
        let mut offset = 0;
        while offset + 2 <= data.len() {
            let length = usize::from(data[offset]);
            if length == 0 {
                offset += 1;
                continue;
            }
            let ad_type = data[offset + 1];
            // A length overrunning the buffer truncates the value and ends
            // the scan at the buffer edge instead of walking past it
            let value_end = (offset + 1 + length).min(data.len());
            let value = &data[offset + 2..value_end];
            self.dispatch(ad_type, value);
            offset = value_end;
        }
    }

    fn dispatch(&mut self, ad_type: u8, value: &[u8]) {
        match ad_type {
            AD_NAME_SHORT | AD_NAME_COMPLETE => {
                let name = String::from_utf8_lossy(value).into_owned();
                // Keep the longer of any previously seen fragment
                if self.name.as_ref().is_none_or(|n| n.len() < name.len()) {
                    self.name = Some(name);
                }
            }
            AD_UUIDS_16_INCOMPLETE | AD_UUIDS_16_COMPLETE => {
                for chunk in value.chunks_exact(2) {
                    self.service_uuids.push(uuid_16(chunk));
                }
            }
            AD_UUIDS_32_INCOMPLETE | AD_UUIDS_32_COMPLETE => {
                for chunk in value.chunks_exact(4) {
                    self.service_uuids.push(uuid_32(chunk));
                }
            }
            AD_UUIDS_128_INCOMPLETE | AD_UUIDS_128_COMPLETE => {
                for chunk in value.chunks_exact(16) {
                    self.service_uuids.push(uuid_128(chunk));
                }
            }
            AD_SERVICE_DATA_16 => push_data(&mut self.service_data, value, 2, uuid_16),
            AD_SERVICE_DATA_32 => push_data(&mut self.service_data, value, 4, uuid_32),
            AD_SERVICE_DATA_128 => push_data(&mut self.service_data, value, 16, uuid_128),
            AD_MANUFACTURER_DATA => push_data(&mut self.manufacturer_data, value, 2, uuid_16),
            _ => {}
        }
    }
}

fn push_data(
    entries: &mut Vec<AdvertisementData>,
    value: &[u8],
    uuid_len: usize,
    to_uuid: fn(&[u8]) -> String,
) {
    if value.len() < uuid_len {
        return;
    }
    entries.push(AdvertisementData {
        uuid: to_uuid(&value[..uuid_len]),
        data: value[uuid_len..].to_vec(),
    });
}

/// Canonicalizes a little-endian 16-bit UUID against the Bluetooth base UUID.
fn uuid_16(bytes: &[u8]) -> String {
    let value = u16::from_le_bytes([bytes[0], bytes[1]]);
    format!("0000{value:04x}-0000-1000-8000-00805f9b34fb")
}

/// Canonicalizes a little-endian 32-bit UUID against the Bluetooth base UUID.
fn uuid_32(bytes: &[u8]) -> String {
    let value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    format!("{value:08x}-0000-1000-8000-00805f9b34fb")
}

/// Formats a little-endian 128-bit UUID as canonical dashed hex.
fn uuid_128(bytes: &[u8]) -> String {
    let mut be = [0_u8; 16];
    for (i, &b) in bytes.iter().take(16).enumerate() {
        be[15 - i] = b;
    }
    let hex = hex::encode(be);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Expands a raw advertisement batch into decoded advertisements.
#[must_use]
pub fn decode_batch(entries: &[RawBleAdvertisement]) -> Vec<Advertisement> {
    entries.iter().map(Advertisement::from_raw).collect()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn raw(data: &[u8]) -> RawBleAdvertisement {
        RawBleAdvertisement {
            address: 0x0011_2233_4455,
            rssi: -70,
            address_type: 0,
            data: Bytes::copy_from_slice(data),
        }
    }

    #[test]
    fn test_complete_name() {
        let adv = Advertisement::from_raw(&raw(&[0x05, 0x09, b'k', b'i', b't', b'c']));
        assert_eq!(adv.name.as_deref(), Some("kitc"));
        assert_eq!(adv.address, 0x0011_2233_4455);
        assert_eq!(adv.rssi, -70);
    }

    #[test]
    fn test_longer_name_fragment_wins() {
        // Short name first, then a longer complete name
        let adv = Advertisement::from_raw(&raw(&[
            0x03, 0x08, b'k', b'i', // shortened "ki"
            0x08, 0x09, b'k', b'i', b't', b'c', b'h', b'e', b'n', // complete "kitchen"
        ]));
        assert_eq!(adv.name.as_deref(), Some("kitchen"));

        // Reversed order keeps the longer one too
        let adv = Advertisement::from_raw(&raw(&[
            0x08, 0x09, b'k', b'i', b't', b'c', b'h', b'e', b'n',
            0x03, 0x08, b'k', b'i',
        ]));
        assert_eq!(adv.name.as_deref(), Some("kitchen"));
    }

    #[test]
    fn test_uuid_16_canonical_padding() {
        // 0x1234 little-endian on the wire
        let adv = Advertisement::from_raw(&raw(&[0x03, 0x03, 0x34, 0x12]));
        assert_eq!(
            adv.service_uuids,
            vec!["00001234-0000-1000-8000-00805f9b34fb".to_string()]
        );
    }

    #[test]
    fn test_uuid_32_canonical_padding() {
        let adv = Advertisement::from_raw(&raw(&[0x05, 0x05, 0x78, 0x56, 0x34, 0x12]));
        assert_eq!(
            adv.service_uuids,
            vec!["12345678-0000-1000-8000-00805f9b34fb".to_string()]
        );
    }

    #[test]
    fn test_uuid_128_canonical_form() {
        // Nordic UART service UUID, little-endian on the wire
        let le: [u8; 16] = [
            0x9E, 0xCA, 0xDC, 0x24, 0x0E, 0xE5, 0xA9, 0xE0, 0x93, 0xF3, 0xA3, 0xB5, 0x01, 0x00,
            0x40, 0x6E,
        ];
        let mut record = vec![0x11, 0x07];
        record.extend_from_slice(&le);
        let adv = Advertisement::from_raw(&raw(&record));
        assert_eq!(
            adv.service_uuids,
            vec!["6e400001-b5a3-f393-e0a9-e50e24dcca9e".to_string()]
        );
    }

    #[test]
    fn test_manufacturer_data_split() {
        // Company id 0x004C plus opaque payload
        let adv = Advertisement::from_raw(&raw(&[0x05, 0xFF, 0x4C, 0x00, 0xAB, 0xCD]));
        assert_eq!(adv.manufacturer_data.len(), 1);
        assert_eq!(
            adv.manufacturer_data[0].uuid,
            "0000004c-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(adv.manufacturer_data[0].data, vec![0xAB, 0xCD]);
    }

    #[test]
    fn test_service_data_16_split() {
        let adv = Advertisement::from_raw(&raw(&[0x06, 0x16, 0x0F, 0x18, 0x64, 0x00, 0x01]));
        assert_eq!(adv.service_data.len(), 1);
        assert_eq!(
            adv.service_data[0].uuid,
            "0000180f-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(adv.service_data[0].data, vec![0x64, 0x00, 0x01]);
    }

    #[test]
    fn test_unknown_type_skipped() {
        let adv = Advertisement::from_raw(&raw(&[
            0x02, 0x01, 0x06, // flags, not decoded
            0x03, 0x03, 0x34, 0x12,
        ]));
        assert_eq!(adv.service_uuids.len(), 1);
        assert!(adv.name.is_none());
    }

    #[test]
    fn test_malformed_length_truncates_without_panic() {
        // Length byte claims 20 bytes but only 4 follow
        let adv = Advertisement::from_raw(&raw(&[0x14, 0x09, b'a', b'b', b'c', b'd']));
        assert_eq!(adv.name.as_deref(), Some("abcd"));

        // The scan stops at the buffer edge instead of walking past it
        let adv = Advertisement::from_raw(&raw(&[0x0A, 0x09, b'a', b'b']));
        assert_eq!(adv.name.as_deref(), Some("ab"));
        assert!(adv.service_uuids.is_empty());
    }

    #[test]
    fn test_trailing_short_record_stops_scan() {
        let adv = Advertisement::from_raw(&raw(&[0x03, 0x03, 0x34, 0x12, 0x05]));
        assert_eq!(adv.service_uuids.len(), 1);
    }

    #[test]
    fn test_decode_batch_one_per_entry() {
        let entries = vec![raw(&[0x03, 0x03, 0x34, 0x12]), raw(&[0x03, 0x08, b'h', b'i'])];
        let advs = decode_batch(&entries);
        assert_eq!(advs.len(), 2);
        assert_eq!(advs[1].name.as_deref(), Some("hi"));
    }
}
