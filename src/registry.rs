//! ## Registry
//!
//! The table of known instruments. It is plain data handed to `connect` and `list_devices`,
//! never global state.
//!
//! A registry can be read from TOML:
//!
//! ```toml
//! [[device]]
//! name = "DM3058 Digital Multimeter"
//! vendor_id = 0x1AB1
//! product_id = 0x09C4
//! # optional, skips endpoint discovery
//! interface = 0
//! endpoint_out = 0x01
//! endpoint_in = 0x82
//! ```
//!

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::constants::usb::RIGOL_VENDOR_ID;

/// ### Device Identity
///
/// Name and USB ids of an instrument, optionally with the interface and endpoints to use.
///
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceIdentity {
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(default)]
    pub interface: Option<u8>,
    #[serde(default)]
    pub endpoint_out: Option<u8>,
    #[serde(default)]
    pub endpoint_in: Option<u8>,
}

impl DeviceIdentity {
    pub fn new(name: impl Into<String>, vendor_id: u16, product_id: u16) -> Self {
        Self {
            name: name.into(),
            vendor_id,
            product_id,
            interface: None,
            endpoint_out: None,
            endpoint_in: None,
        }
    }

    /// Pin the interface and endpoints instead of discovering them.
    #[must_use]
    pub fn with_endpoints(mut self, interface: u8, endpoint_out: u8, endpoint_in: u8) -> Self {
        self.interface = Some(interface);
        self.endpoint_out = Some(endpoint_out);
        self.endpoint_in = Some(endpoint_in);
        self
    }

    /// The model token, e.g. `DM3058` for "DM3058 Digital Multimeter"
    pub fn model(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or("")
    }
}

/// ### Registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    devices: Vec<DeviceIdentity>,
}

#[derive(Deserialize)]
struct RegistryFile {
    #[serde(default, rename = "device")]
    devices: Vec<DeviceIdentity>,
}

impl Default for Registry {
    fn default() -> Self {
        let v = RIGOL_VENDOR_ID;
        Registry::new(vec![
            DeviceIdentity::new("DM3058 Digital Multimeter", v, 0x09C4).with_endpoints(0, 0x01, 0x82),
            DeviceIdentity::new("DP832 Prog DC Power Supply", v, 0x0E11).with_endpoints(0, 0x03, 0x82),
            DeviceIdentity::new("DS4024 Digital Oscilloscope", v, 0x04B1).with_endpoints(0, 0x06, 0x85),
            DeviceIdentity::new("DS1102E Digital Oscilloscope", v, 0x0588).with_endpoints(0, 0x01, 0x82),
            DeviceIdentity::new("DSA815 Spectrum Analyzer", v, 0x0960).with_endpoints(0, 0x02, 0x86),
            // shows up as 0x0588 while in printer mode
            DeviceIdentity::new("DG4162 Func/Wave Generator", v, 0x0641).with_endpoints(0, 0x02, 0x86),
            DeviceIdentity::new("DS1054Z Digital Oscilloscope", v, 0x04CE),
        ])
    }
}

impl Registry {
    pub fn new(devices: Vec<DeviceIdentity>) -> Self {
        Self { devices }
    }

    /// ### From TOML
    ///
    /// Parse a registry from a TOML document made of `[[device]]` tables.
    ///
    pub fn from_toml_str(text: &str) -> Result<Registry> {
        let file: RegistryFile = toml::from_str(text).context("invalid registry file")?;
        Ok(Registry::new(file.devices))
    }

    /// ### Load
    ///
    /// Read and parse a registry file.
    ///
    pub fn load(path: impl AsRef<Path>) -> Result<Registry> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read registry {}", path.display()))?;
        Registry::from_toml_str(&text)
    }

    pub fn devices(&self) -> &[DeviceIdentity] {
        &self.devices
    }

    /// ### Find
    ///
    /// Look an entry up by full name, then by model token, then by unambiguous name prefix.
    /// All comparisons ignore ASCII case.
    ///
    pub fn find(&self, query: &str) -> Option<&DeviceIdentity> {
        let query = query.trim();
        if query.is_empty() {
            return None;
        }
        if let Some(dev) = self.devices.iter().find(|d| d.name.eq_ignore_ascii_case(query)) {
            return Some(dev);
        }
        if let Some(dev) = self.devices.iter().find(|d| d.model().eq_ignore_ascii_case(query)) {
            return Some(dev);
        }

        let query = query.to_ascii_lowercase();
        let mut matches = self
            .devices
            .iter()
            .filter(|d| d.name.to_ascii_lowercase().starts_with(&query));
        match (matches.next(), matches.next()) {
            (Some(dev), None) => Some(dev),
            _ => None,
        }
    }

    /// Entries whose ids match an attached device
    pub fn lookup(&self, vendor_id: u16, product_id: u16) -> Option<&DeviceIdentity> {
        self.devices
            .iter()
            .find(|d| d.vendor_id == vendor_id && d.product_id == product_id)
    }

    pub fn has_vendor(&self, vendor_id: u16) -> bool {
        self.devices.iter().any(|d| d.vendor_id == vendor_id)
    }
}
