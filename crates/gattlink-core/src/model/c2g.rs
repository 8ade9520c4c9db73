// ── Cloud-to-gateway operation parsing ──
//
// An envelope is valid only if it carries `type: "operation"`, an id,
// and an operation type; anything else is a protocol error for that
// message. A valid envelope whose operation is missing the fields its
// kind requires parses to `None` and is dropped by the caller.

use serde::Deserialize;

use crate::error::CoreError;
use crate::model::attributes::AttributePath;
use gattlink_ble::{Address, ScanRequest, ScanType};

/// A parsed, field-complete operation request.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    /// Cloud request id, echoed back on the result event.
    pub request_id: String,
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Scan(ScanRequest),
    Discover {
        address: Address,
    },
    CharacteristicRead {
        address: Address,
        path: AttributePath,
    },
    CharacteristicWrite {
        address: Address,
        path: AttributePath,
        value: Vec<u8>,
        ack: bool,
    },
    DescriptorRead {
        address: Address,
        path: AttributePath,
    },
    DescriptorWrite {
        address: Address,
        path: AttributePath,
        value: Vec<u8>,
        ack: bool,
    },
    GatewayStatus,
    DeleteYourself,
}

// ── Raw wire shapes ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    id: Option<String>,
    operation: Option<RawOperation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOperation {
    #[serde(rename = "type")]
    kind: Option<String>,

    // scan
    scan_mode: Option<String>,
    scan_type: Option<u8>,
    scan_interval: Option<u32>,
    scan_window: Option<u32>,
    scan_timeout: Option<u32>,
    scan_reporting: Option<String>,
    filter: Option<RawScanFilter>,

    // device operations
    device_address: Option<Address>,
    #[serde(rename = "serviceUUID")]
    service_uuid: Option<String>,
    #[serde(rename = "characteristicUUID")]
    characteristic_uuid: Option<String>,
    #[serde(rename = "descriptorUUID")]
    descriptor_uuid: Option<String>,
    characteristic_value: Option<Vec<u8>>,
    descriptor_value: Option<Vec<u8>>,
    ack: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawScanFilter {
    rssi: Option<i32>,
    name: Option<String>,
}

/// Parse a c2g payload. `Err` is a protocol error (malformed envelope),
/// `Ok(None)` a silently dropped field-incomplete operation.
pub fn parse_operation(payload: &[u8]) -> Result<Option<OperationRequest>, CoreError> {
    let envelope: RawEnvelope = serde_json::from_slice(payload)?;

    if envelope.kind.as_deref() != Some("operation") {
        return Err(CoreError::Protocol {
            message: "message is not an operation envelope".into(),
        });
    }
    let request_id = envelope.id.ok_or_else(|| CoreError::Protocol {
        message: "operation envelope has no id".into(),
    })?;
    let op = envelope.operation.ok_or_else(|| CoreError::Protocol {
        message: "operation envelope has no operation".into(),
    })?;
    let kind = op.kind.clone().ok_or_else(|| CoreError::Protocol {
        message: "operation has no type".into(),
    })?;

    Ok(build(&kind, op).map(|operation| OperationRequest {
        request_id,
        operation,
    }))
}

/// Kind-specific field validation. `None` means the operation named a
/// valid kind but lacks a required field.
fn build(kind: &str, op: RawOperation) -> Option<Operation> {
    match kind {
        "scan" => Some(Operation::Scan(scan_request(&op))),
        "device_discover" => Some(Operation::Discover {
            address: op.device_address?,
        }),
        "device_characteristic_value_read" => Some(Operation::CharacteristicRead {
            address: op.device_address?,
            path: AttributePath::characteristic(op.service_uuid?, op.characteristic_uuid?),
        }),
        "device_characteristic_value_write" => Some(Operation::CharacteristicWrite {
            address: op.device_address?,
            path: AttributePath::characteristic(op.service_uuid?, op.characteristic_uuid?),
            value: op.characteristic_value?,
            ack: op.ack.unwrap_or(false),
        }),
        "device_descriptor_value_read" => Some(Operation::DescriptorRead {
            address: op.device_address?,
            path: AttributePath::descriptor(
                op.service_uuid?,
                op.characteristic_uuid?,
                op.descriptor_uuid?,
            ),
        }),
        "device_descriptor_value_write" => Some(Operation::DescriptorWrite {
            address: op.device_address?,
            path: AttributePath::descriptor(
                op.service_uuid?,
                op.characteristic_uuid?,
                op.descriptor_uuid?,
            ),
            value: op.descriptor_value?,
            ack: op.ack.unwrap_or(false),
        }),
        "get_gateway_status" => Some(Operation::GatewayStatus),
        "delete_yourself" => Some(Operation::DeleteYourself),
        // Unknown kinds drop like field-incomplete ones.
        _ => None,
    }
}

fn scan_request(op: &RawOperation) -> ScanRequest {
    let defaults = ScanRequest::default();
    ScanRequest {
        active: op.scan_mode.as_deref() == Some("active"),
        interval: op.scan_interval.unwrap_or(defaults.interval),
        window: op.scan_window.unwrap_or(defaults.window),
        timeout_secs: op.scan_timeout.unwrap_or(defaults.timeout_secs),
        batch: op.scan_reporting.as_deref() == Some("batch"),
        rssi_floor: op.filter.as_ref().and_then(|f| f.rssi),
        name_filter: op.filter.as_ref().and_then(|f| f.name.clone()),
        scan_type: if op.scan_type == Some(1) {
            ScanType::Beacon
        } else {
            ScanType::Regular
        },
    }
}
