//! ## Classify
//!
//! Decide whether a reassembled reply is plain text or a `#<d><len>` data block, and what the
//! block holds.
//!

use log::debug;

use crate::constants::block::{BITMAP_MAGIC, BLOCK_MARKER, JPEG_MAGIC, WAVEFORM_POINTS};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Bitmap,
    Jpeg,
}

impl ImageKind {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageKind::Bitmap => "bmp",
            ImageKind::Jpeg => "jpg",
        }
    }
}

/// ### Data Block Header
///
/// `#`, one digit `d`, then `d` digits giving the payload length.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlockHeader {
    /// Width of the length field
    pub digits: usize,
    /// Payload length announced by the device
    pub declared_len: usize,
}

impl DataBlockHeader {
    pub fn header_len(&self) -> usize {
        self.digits + 2
    }
}

/// ### Response
///
/// A classified reply. Block variants keep the textual header for display.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Text(String),
    Image {
        kind: ImageKind,
        header: String,
        data: Vec<u8>,
    },
    /// One byte per sample, 0 to 255
    Waveform {
        header: String,
        samples: Box<[u8; WAVEFORM_POINTS]>,
    },
    /// A block that is neither an image nor a screen sized waveform
    OversizedWaveform {
        header: String,
        declared: usize,
        received: usize,
    },
}

/// ### Parse Block Header
pub fn parse_block_header(bytes: &[u8]) -> Result<DataBlockHeader, Error> {
    if bytes.first() != Some(&BLOCK_MARKER) {
        return Err(Error::BlockHeader("missing '#' marker".into()));
    }

    let digits = match bytes.get(1).copied() {
        Some(d @ b'1'..=b'9') => (d - b'0') as usize,
        Some(d) => return Err(Error::BlockHeader(format!("bad digit count {:?}", d as char))),
        None => return Err(Error::BlockHeader("truncated".into())),
    };

    let field = bytes
        .get(2..2 + digits)
        .ok_or_else(|| Error::BlockHeader(format!("expected {digits} length digits")))?;
    if !field.iter().all(u8::is_ascii_digit) {
        return Err(Error::BlockHeader(format!(
            "non-digit in length field {:?}",
            String::from_utf8_lossy(field)
        )));
    }

    let declared_len = field
        .iter()
        .fold(0usize, |acc, d| acc * 10 + (d - b'0') as usize);

    Ok(DataBlockHeader { digits, declared_len })
}

/// ### Classify
///
/// Never fails: a reply with a broken block header is returned as text.
///
pub fn classify(bytes: Vec<u8>) -> Response {
    let header = match parse_block_header(&bytes) {
        Ok(header) => header,
        Err(e) => {
            if bytes.first() == Some(&BLOCK_MARKER) {
                debug!("treating reply as text: {e}");
            }
            return Response::Text(String::from_utf8_lossy(&bytes).trim().to_string());
        }
    };

    let mut payload = bytes;
    let prefix: Vec<u8> = payload.drain(..header.header_len()).collect();
    let prefix = String::from_utf8_lossy(&prefix).into_owned();

    if payload.starts_with(&BITMAP_MAGIC) {
        debug!("bitmap block {prefix}");
        return Response::Image {
            kind: ImageKind::Bitmap,
            header: prefix,
            data: payload,
        };
    }
    if payload.starts_with(&JPEG_MAGIC) {
        debug!("jpeg block {prefix}");
        return Response::Image {
            kind: ImageKind::Jpeg,
            header: prefix,
            data: payload,
        };
    }

    let received = payload.len();
    match <Box<[u8; WAVEFORM_POINTS]>>::try_from(payload.into_boxed_slice()) {
        Ok(samples) => Response::Waveform {
            header: prefix,
            samples,
        },
        Err(_) => {
            debug!("block {prefix} of {received} bytes is not a screen waveform");
            Response::OversizedWaveform {
                header: prefix,
                declared: header.declared_len,
                received,
            }
        }
    }
}
