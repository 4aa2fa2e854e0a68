//! ## Constants
//!
//! Various constants used throughout the project.
//!

pub mod usb {
    /// Vendor id used by Rigol bench instruments
    pub const RIGOL_VENDOR_ID: u16 = 0x1AB1;
    /// Device class code reported by hubs, skipped when describing the bus
    pub const HUB_CLASS_CODE: u8 = 0x09;
    /// Max packet size assumed when an endpoint descriptor cannot be read
    pub const FALLBACK_PACKET_SIZE: u16 = 64;
}

pub mod misc {
    use std::time::Duration;

    /// The bound on every single bulk transfer
    pub const BULK_TIMEOUT_DURATION: Duration = Duration::from_millis(500);
    /// The size in bytes of the header in a bulk transfer
    pub const HEADER_SIZE: usize = 12;
    /// Packet sizes above this break communication with some instruments
    pub const MAX_BLOCK_SIZE: usize = 512;
    /// How many times a busy/stalled bulk read is retried before giving up
    pub const TRANSIENT_READ_RETRIES: usize = 3;
    /// Reply frames read under one tag before the reply is abandoned
    pub const MAX_REPLY_FRAMES: usize = 1 << 20;
    /// Line terminator appended to every command
    pub const COMMAND_TERMINATOR: char = '\n';
    /// Delay used by a bare `DLY` step
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(1);
}

pub mod block {
    /// First byte of a length-prefixed data block
    pub const BLOCK_MARKER: u8 = b'#';
    /// Magic of a Windows bitmap
    pub const BITMAP_MAGIC: [u8; 2] = *b"BM";
    /// Magic of a JPEG stream (SOI marker)
    pub const JPEG_MAGIC: [u8; 2] = [0xFF, 0xD8];
    /// Number of samples in a screen waveform capture
    pub const WAVEFORM_POINTS: usize = 600;
}

pub mod bulk_msg_id {
    pub const DEVICE_DEPENDENT_MSG_OUT: u8 = 1;
    pub const REQUEST_DEVICE_DEPENDENT_MSG_IN: u8 = 2;
}

pub mod bulk_attributes {
    /// End of message bit in the attributes byte (offset 8)
    pub const END_OF_MESSAGE: u8 = 0b0000_0001;
}
