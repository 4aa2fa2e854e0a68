//! ## Errors
//!
//! The errors used throughout the crate.
//!

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("libusb error: {0}")]
    Usb(#[from] rusb::Error),

    // Connection
    #[error("no attached device matches {name} ({vendor_id:04X}:{product_id:04X})")]
    DeviceNotFound {
        name: String,
        vendor_id: u16,
        product_id: u16,
    },
    #[error("bulk in/out endpoint pair not found")]
    EndpointsNotFound,
    #[error("unable to open device: {0}")]
    Open(rusb::Error),
    #[error("unable to claim interface {interface}: {source}")]
    Claim { interface: u8, source: rusb::Error },

    // Transport
    #[error("bulk transfer timed out after {} ms", .0.as_millis())]
    Timeout(Duration),
    #[error("bulk {direction} transfer failed: {source}")]
    Transfer {
        direction: &'static str,
        source: rusb::Error,
    },
    #[error("received {0} bytes, shorter than a frame header")]
    TruncatedFrame(usize),
    #[error("frame of {size} bytes exceeds packet size {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("no end of message after {0} reply frames")]
    UnterminatedReply(usize),

    // Protocol
    #[error("malformed data block header: {0}")]
    BlockHeader(String),
}

impl Error {
    /// Failed before a connection existed
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Error::DeviceNotFound { .. } | Error::EndpointsNotFound | Error::Open(_) | Error::Claim { .. }
        )
    }

    /// Failed while moving bytes over an open connection
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::Transfer { .. }
                | Error::TruncatedFrame(_)
                | Error::FrameTooLarge { .. }
                | Error::UnterminatedReply(_)
        )
    }

    /// Only a busy or stalled pipe is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transfer {
                source: rusb::Error::Busy | rusb::Error::Pipe,
                ..
            }
        )
    }

    pub(crate) fn from_transfer(direction: &'static str, timeout: Duration, source: rusb::Error) -> Error {
        match source {
            rusb::Error::Timeout => Error::Timeout(timeout),
            source => Error::Transfer { direction, source },
        }
    }
}
