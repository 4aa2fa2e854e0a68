//! Bulk
//!
//! Layout of the 12 byte header that prefixes every bulk transfer, in both directions.
//!
//! ```text
//!  0      1     2       3     4..8            8      9..12   12..
//! +------+-----+-------+-----+---------------+------+-------+---------+
//! | msg  | tag | !tag  |  0  | transfer size | attr |   0   | payload |
//! +------+-----+-------+-----+---------------+------+-------+---------+
//! ```
//!

use crate::constants::{bulk_attributes, bulk_msg_id, misc::HEADER_SIZE};
use crate::error::Error;

/// Fields read back from a device's reply header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundHeader {
    /// Payload bytes the device claims follow the header
    pub declared_len: usize,
    /// Set on the last chunk of the reply
    pub end_of_message: bool,
}

pub fn device_dependent_msg_out_header(
    btag: u8,
    transfer_size: u32,
    end_of_message: bool,
) -> [u8; HEADER_SIZE] {
    let mut header = base_header(bulk_msg_id::DEVICE_DEPENDENT_MSG_OUT, btag, transfer_size);

    if end_of_message {
        header[8] = bulk_attributes::END_OF_MESSAGE;
    }

    header
}

pub fn request_device_dependent_msg_in_header(btag: u8, transfer_size: u32) -> [u8; HEADER_SIZE] {
    base_header(bulk_msg_id::REQUEST_DEVICE_DEPENDENT_MSG_IN, btag, transfer_size)
}

fn base_header(msg_id: u8, btag: u8, transfer_size: u32) -> [u8; HEADER_SIZE] {
    let mut header = [0x00; HEADER_SIZE];

    header[0] = msg_id;
    header[1] = btag;
    header[2] = btag ^ 0xFF;
    header[4..8].copy_from_slice(&transfer_size.to_le_bytes());

    header
}

/// ### Build Outbound Chunk
///
/// Header, then the payload slice, then zero padding up to a multiple of 4 bytes.
///
pub fn build_outbound_chunk(btag: u8, payload: &[u8], is_last_chunk: bool) -> Vec<u8> {
    let header = device_dependent_msg_out_header(btag, payload.len() as u32, is_last_chunk);

    let mut frame = Vec::with_capacity((HEADER_SIZE + payload.len()).next_multiple_of(4));
    frame.extend_from_slice(&header);
    frame.extend_from_slice(payload);
    frame.resize(frame.len().next_multiple_of(4), 0x00);

    frame
}

/// ### Build Inbound Request
///
/// A bare header asking the device for up to `requested_max_bytes` of reply.
///
pub fn build_inbound_request(btag: u8, requested_max_bytes: u32) -> Vec<u8> {
    request_device_dependent_msg_in_header(btag, requested_max_bytes).to_vec()
}

/// ### Parse Inbound Header
///
/// Only the low 16 bits of the transfer size are honoured.
///
pub fn parse_inbound_header(frame: &[u8]) -> Result<InboundHeader, Error> {
    if frame.len() < HEADER_SIZE {
        return Err(Error::TruncatedFrame(frame.len()));
    }

    Ok(InboundHeader {
        declared_len: u16::from_le_bytes([frame[4], frame[5]]) as usize,
        end_of_message: frame[8] != 0,
    })
}

/// The payload of a reply frame, cut to the declared length or to what actually arrived
pub fn inbound_payload<'a>(frame: &'a [u8], header: &InboundHeader) -> &'a [u8] {
    let end = (HEADER_SIZE + header.declared_len).min(frame.len());
    &frame[HEADER_SIZE.min(end)..end]
}
