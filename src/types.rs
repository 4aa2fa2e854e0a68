//! ## Types
//!
//! The different types used across the crate
//!

use std::fmt;

use rusb::{Direction, TransferType};

/// ### bTag
///
/// The bTag element used to identify a bulk transfer.
///
/// Each call to `next` increments the value before handing it out. Past 255 it wraps around to 1,
/// so a fresh counter yields 1 first and 0 is never produced.
///
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BTag(u8);

impl BTag {
    /// ### New
    ///
    /// Return a fresh bTag whose first value will be 1.
    ///
    pub fn new() -> BTag {
        BTag(0)
    }

    /// ### Next
    ///
    /// Advance the counter and return the new value.
    ///
    pub fn next(&mut self) -> u8 {
        self.0 = match self.0 {
            255 => 1,
            n => n + 1,
        };
        self.0
    }

    /// The last value handed out (0 before the first transfer)
    pub fn current(&self) -> u8 {
        self.0
    }
}

/// ### Endpoint
///
/// Properties of an endpoint.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// Address of the endpoint on the interface
    pub address: u8,
    /// The maximal size a packet can have on this endpoint
    pub max_packet_size: u16,
}

/// ### Bulk Endpoints
///
/// The endpoint pair a connection talks through.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BulkEndpoints {
    /// The interface both endpoints belong to
    pub interface_number: u8,
    pub bulk_out_ep: Endpoint,
    pub bulk_in_ep: Endpoint,
}

/// ### Endpoint Description
#[derive(Clone, Debug)]
pub struct EndpointDescription {
    pub address: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
}

/// ### Interface Description
#[derive(Clone, Debug)]
pub struct InterfaceDescription {
    pub number: u8,
    pub endpoints: Vec<EndpointDescription>,
}

/// ### Device Description
///
/// What the bus reports about an attached instrument.
///
#[derive(Clone, Debug)]
pub struct DeviceDescription {
    /// Registry name, when the ids match a registry entry
    pub name: Option<String>,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus: u8,
    pub address: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub interfaces: Vec<InterfaceDescription>,
}

impl fmt::Display for EndpointDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.transfer_type {
            TransferType::Control => "CON",
            TransferType::Isochronous => "ISO",
            TransferType::Bulk => "BLK",
            TransferType::Interrupt => "INT",
        };
        let dir = match self.direction {
            Direction::In => "(IN) ",
            Direction::Out => "(OUT)",
        };
        write!(
            f,
            "{kind} add: 0x{:02X} {dir} pkt: {}",
            self.address, self.max_packet_size
        )
    }
}

impl fmt::Display for DeviceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unknown = "<unavailable>";
        writeln!(
            f,
            "Bus: {:03} Device {:03}: Vendor 0x{:04X}, Product 0x{:04X}",
            self.bus, self.address, self.vendor_id, self.product_id
        )?;
        if let Some(name) = &self.name {
            writeln!(f, "Registry:     {name}")?;
        }
        writeln!(f, "Manufacturer: {}", self.manufacturer.as_deref().unwrap_or(unknown))?;
        writeln!(f, "Product:      {}", self.product.as_deref().unwrap_or(unknown))?;
        writeln!(f, "SerialNumber: {}", self.serial_number.as_deref().unwrap_or(unknown))?;
        for interface in self.interfaces.iter().filter(|i| !i.endpoints.is_empty()) {
            writeln!(f, "  Interface: {}", interface.number)?;
            for endpoint in &interface.endpoints {
                writeln!(f, "    {endpoint}")?;
            }
        }
        Ok(())
    }
}
