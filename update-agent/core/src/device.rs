use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

/// The firmware components of a device that can be updated independently.
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum ComponentId {
    /// Main-controller firmware.
    Main,
    /// Radio/co-processor firmware.
    Radio,
}

impl ComponentId {
    pub const ALL: [ComponentId; 2] = [ComponentId::Main, ComponentId::Radio];

    pub fn as_str(self) -> &'static str {
        match self {
            ComponentId::Main => "main",
            ComponentId::Radio => "radio",
        }
    }

    /// File extension the cached artifact of this component must carry.
    pub fn artifact_extension(self) -> &'static str {
        match self {
            ComponentId::Main => "bin",
            ComponentId::Radio => "zip",
        }
    }
}

impl Display for ComponentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("failed to parse unknown string `{0}` as {1}")]
pub struct ParseError(String, &'static str);

impl FromStr for ComponentId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(ComponentId::Main),
            "radio" => Ok(ComponentId::Radio),
            other => Err(ParseError(other.to_string(), "component")),
        }
    }
}

/// The physical channel used to talk to a device.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Ble,
    Nfc,
    Usb,
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportKind::Ble => "ble",
            TransportKind::Nfc => "nfc",
            TransportKind::Usb => "usb",
        };
        f.write_str(s)
    }
}

impl FromStr for TransportKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ble" => Ok(TransportKind::Ble),
            "nfc" => Ok(TransportKind::Nfc),
            "usb" => Ok(TransportKind::Usb),
            other => Err(ParseError(other.to_string(), "transport")),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A paired hardware wallet as known at the start of an update.
///
/// Discovery happens elsewhere; the update core only refreshes `installed` after a
/// successful flash.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    /// Transport specific address: a BLE MAC, an NFC tag id or a USB path.
    pub address: String,
    pub transport: TransportKind,
    #[serde(default)]
    pub installed: BTreeMap<ComponentId, String>,
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub needs_backup: bool,
    #[serde(default)]
    pub bootloader_mode: bool,
}

impl Device {
    pub fn installed_version(&self, component: ComponentId) -> Option<&str> {
        self.installed.get(&component).map(String::as_str)
    }

    /// Records the version now running on the device after a verified flash.
    pub fn record_flashed_version(&mut self, component: ComponentId, version: &str) {
        self.installed.insert(component, version.to_string());
    }
}
