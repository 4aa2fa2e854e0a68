//! # Rigol Comm
//!
//! Send SCPI commands to USB bench instruments (multimeters, oscilloscopes, power supplies,
//! signal generators) and get back either a text reply or a typed binary block.
//!
//! Commands travel over the instrument's bulk endpoints, each frame prefixed with the 12 byte
//! USBTMC style header. Replies are reassembled until the device flags the end of the message,
//! then classified as text, a bitmap or JPEG screen capture, or a waveform.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rigol_comm::{InstrumentClient, Registry, Response};
//!
//! fn main() -> anyhow::Result<()> {
//!     let registry = Registry::default();
//!     let identity = registry.find("DM3058").expect("unknown instrument");
//!     let mut meter = InstrumentClient::new(identity.clone());
//!
//!     // switch function, give the meter a second to settle, then measure
//!     if let Some(Response::Text(volts)) = meter.execute(":FUNC:VOLT:DC;DLY1;:MEAS:VOLT:DC?")? {
//!         println!("{volts} V");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Batches
//!
//! A command string is split on `;`. `DLY<seconds>` steps sleep locally (one second when no
//! number follows), every other step is sent to the device, and steps containing `?` have their
//! reply read back. Only the last step's reply is returned.
//!
//! Calls block. Each call opens its own connection and releases it before returning, so callers
//! running this from a UI must keep it off their event thread and must not start a second call
//! before the first returns.
//!

mod classify;
mod constants;
mod error;
mod init;
mod registry;
mod session;
mod types;
mod communication {
    pub mod bulk;
    pub mod exchange;
    pub mod transport;
}

pub use classify::{classify, parse_block_header, DataBlockHeader, ImageKind, Response};
pub use communication::transport::{Transport, UsbConnection};
pub use constants::block::WAVEFORM_POINTS;
pub use error::Error;
pub use registry::{DeviceIdentity, Registry};
pub use session::{parse_steps, CommandSession, Step};
pub use types::{
    BTag, BulkEndpoints, DeviceDescription, Endpoint, EndpointDescription, InterfaceDescription,
};

use anyhow::Result;

/// ### Connect
///
/// Open and claim the instrument described by `identity`.
///
pub fn connect(identity: &DeviceIdentity) -> Result<UsbConnection> {
    Ok(init::connect(identity)?)
}

/// ### List Devices
///
/// Describe the attached instruments whose vendor appears in `registry`.
///
pub fn list_devices(registry: &Registry) -> Result<Vec<DeviceDescription>> {
    Ok(init::list_devices(registry)?)
}

/// ### Execute
///
/// Run one command batch against a freshly opened connection.
///
pub fn execute(identity: &DeviceIdentity, command: &str) -> Result<Option<Response>> {
    InstrumentClient::new(identity.clone()).execute(command)
}

/// ### InstrumentClient
///
/// An instrument to run command batches against. The bTag sequence carries over from one batch
/// to the next.
///
#[derive(Debug, Clone)]
pub struct InstrumentClient {
    identity: DeviceIdentity,
    btag: BTag,
}

impl InstrumentClient {
    pub fn new(identity: DeviceIdentity) -> InstrumentClient {
        InstrumentClient {
            identity,
            btag: BTag::new(),
        }
    }

    /// ### From Registry
    ///
    /// Look the instrument up by name or model.
    ///
    pub fn from_registry(registry: &Registry, query: &str) -> Result<InstrumentClient> {
        let identity = registry
            .find(query)
            .ok_or_else(|| anyhow::anyhow!("no registry entry matches {query:?}"))?;
        Ok(InstrumentClient::new(identity.clone()))
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// ### Execute
    ///
    /// Connect, run the batch and release the connection.
    ///
    /// #### Arguments
    /// - `command` -> `;` separated steps, e.g. `":FUNC:RES;DLY1;:MEAS:RES?"`
    ///
    pub fn execute(&mut self, command: &str) -> Result<Option<Response>> {
        let mut connection = init::connect(&self.identity)?;

        let response = CommandSession::new(&mut connection, &mut self.btag).run(command)?;

        Ok(response)
    }
}
