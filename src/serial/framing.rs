// COBS framing for serial lines
//
// Each packet is COBS-encoded so it contains no zero bytes, then terminated
// with a single 0x00. A receiver resynchronizes at the next zero after any
// corruption.

use anyhow::{anyhow, Result};

pub const FRAME_DELIMITER: u8 = 0x00;

/// Largest accepted frame: a 64 KiB payload plus COBS overhead and delimiter
pub const MAX_FRAME_LEN: usize = 65_536 + 65_536 / 254 + 2;

/// Encode a payload into one delimited frame
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = cobs::encode_vec(payload);
    frame.push(FRAME_DELIMITER);
    frame
}

/// Decode one frame; the trailing delimiter is optional
pub fn decode_frame(frame: &[u8]) -> Result<Vec<u8>> {
    let body = frame.strip_suffix(&[FRAME_DELIMITER]).unwrap_or(frame);
    cobs::decode_vec(body).map_err(|e| anyhow!("Invalid COBS frame ({} bytes): {:?}", body.len(), e))
}
