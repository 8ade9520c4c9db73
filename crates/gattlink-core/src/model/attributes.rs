// ── Discovery cache ──
//
// One attribute tree per device, created on first discovery and
// replaced wholesale on forced re-discovery. Never merged.

use serde_json::{Map, Value, json};

use crate::error::CoreError;
use gattlink_ble::{Characteristic, Descriptor, Service};

/// Composite attribute path `service/characteristic[/descriptor]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributePath {
    pub service: String,
    pub characteristic: String,
    pub descriptor: Option<String>,
}

impl AttributePath {
    pub fn characteristic(service: impl Into<String>, characteristic: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            characteristic: characteristic.into(),
            descriptor: None,
        }
    }

    pub fn descriptor(
        service: impl Into<String>,
        characteristic: impl Into<String>,
        descriptor: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            characteristic: characteristic.into(),
            descriptor: Some(descriptor.into()),
        }
    }

    pub fn parse(path: &str) -> Result<Self, CoreError> {
        let mut parts = path.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(svc), Some(chr), None, _) if !svc.is_empty() && !chr.is_empty() => {
                Ok(Self::characteristic(svc, chr))
            }
            (Some(svc), Some(chr), Some(desc), None)
                if !svc.is_empty() && !chr.is_empty() && !desc.is_empty() =>
            {
                Ok(Self::descriptor(svc, chr, desc))
            }
            _ => Err(CoreError::AttributeNotFound { path: path.into() }),
        }
    }
}

impl std::fmt::Display for AttributePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.descriptor {
            Some(desc) => write!(f, "{}/{}/{}", self.service, self.characteristic, desc),
            None => write!(f, "{}/{}", self.service, self.characteristic),
        }
    }
}

/// A device's discovered attribute tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveredAttributes {
    services: Vec<Service>,
}

impl DiscoveredAttributes {
    pub fn new(services: Vec<Service>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn find_characteristic(&self, path: &AttributePath) -> Option<&Characteristic> {
        self.services
            .iter()
            .find(|s| s.uuid == path.service)?
            .characteristics
            .iter()
            .find(|c| c.uuid == path.characteristic)
    }

    pub fn find_characteristic_mut(&mut self, path: &AttributePath) -> Option<&mut Characteristic> {
        self.services
            .iter_mut()
            .find(|s| s.uuid == path.service)?
            .characteristics
            .iter_mut()
            .find(|c| c.uuid == path.characteristic)
    }

    pub fn find_descriptor(&self, path: &AttributePath) -> Option<&Descriptor> {
        let wanted = path.descriptor.as_deref()?;
        self.find_characteristic(path)?
            .descriptors
            .iter()
            .find(|d| d.uuid == wanted)
    }

    pub fn find_descriptor_mut(&mut self, path: &AttributePath) -> Option<&mut Descriptor> {
        let wanted = path.descriptor.clone()?;
        self.find_characteristic_mut(path)?
            .descriptors
            .iter_mut()
            .find(|d| d.uuid == wanted)
    }

    /// The uuid-keyed nested map shape the cloud expects for discover
    /// results.
    pub fn to_cloud_json(&self) -> Value {
        let mut services = Map::new();
        for svc in &self.services {
            let mut characteristics = Map::new();
            for chr in &svc.characteristics {
                let mut descriptors = Map::new();
                for desc in &chr.descriptors {
                    descriptors.insert(
                        desc.uuid.clone(),
                        json!({ "uuid": desc.uuid, "value": desc.value }),
                    );
                }
                characteristics.insert(
                    chr.uuid.clone(),
                    json!({
                        "uuid": chr.uuid,
                        "value": chr.value,
                        "properties": chr.properties,
                        "descriptors": descriptors,
                    }),
                );
            }
            services.insert(
                svc.uuid.clone(),
                json!({ "uuid": svc.uuid, "characteristics": characteristics }),
            );
        }
        Value::Object(services)
    }
}
