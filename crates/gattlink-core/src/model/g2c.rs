// ── Gateway-to-cloud event documents ──
//
// The facade wraps these in the `{type: "event", gatewayId, requestId?,
// event}` envelope and stamps `messageId` and `timestamp`.

use serde::Serialize;
use serde_json::Value;

use crate::model::device::ConnectionEntry;
use gattlink_ble::{Characteristic, Descriptor, DeviceDiscovered};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum G2cEvent {
    #[serde(rename = "scan_result")]
    ScanResult {
        #[serde(rename = "subType")]
        sub_type: ScanReporting,
        devices: Vec<DeviceDiscovered>,
        timeout: bool,
    },

    #[serde(rename = "device_connect_result")]
    DeviceConnectResult { device: ConnectionEntry },

    #[serde(rename = "device_disconnect")]
    DeviceDisconnect { device: ConnectionEntry },

    #[serde(rename = "device_discover_result")]
    DeviceDiscoverResult {
        device: ConnectionEntry,
        /// uuid-keyed attribute tree
        services: Value,
    },

    #[serde(rename = "device_characteristic_value_read_result")]
    CharacteristicValueReadResult {
        device: ConnectionEntry,
        characteristic: Characteristic,
    },

    #[serde(rename = "device_characteristic_value_write_result")]
    CharacteristicValueWriteResult {
        device: ConnectionEntry,
        characteristic: Characteristic,
    },

    #[serde(rename = "device_characteristic_value_changed")]
    CharacteristicValueChanged {
        device: ConnectionEntry,
        characteristic: Characteristic,
    },

    #[serde(rename = "device_descriptor_value_read_result")]
    DescriptorValueReadResult {
        device: ConnectionEntry,
        descriptor: Descriptor,
    },

    #[serde(rename = "device_descriptor_value_write_result")]
    DescriptorValueWriteResult {
        device: ConnectionEntry,
        descriptor: Descriptor,
    },

    #[serde(rename = "device_descriptor_value_changed")]
    DescriptorValueChanged {
        device: ConnectionEntry,
        descriptor: Descriptor,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ScanReporting {
    Instant,
    Batch,
}
