//! Byte encodings accepted on characteristic writes.
//! Values cross the bridge as strings; the encoding names how to turn them
//! into bytes. Outbound payloads are always reported hex-encoded.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{BleError, Result};

/// Supported write-value encodings. Anything unrecognized falls back to utf8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueEncoding {
    #[default]
    Utf8,
    Base64,
    Hex,
}

impl ValueEncoding {
    /// Parses an encoding name from bridge parameters.
    pub fn parse(name: Option<&str>) -> Self {
        match name.map(|n| n.to_ascii_lowercase()).as_deref() {
            Some("base64") => ValueEncoding::Base64,
            Some("hex") => ValueEncoding::Hex,
            _ => ValueEncoding::Utf8,
        }
    }
}

/// Decodes a bridge value string into raw bytes.
pub fn decode_value(value: &str, encoding: ValueEncoding) -> Result<Vec<u8>> {
    match encoding {
        ValueEncoding::Utf8 => Ok(value.as_bytes().to_vec()),
        ValueEncoding::Base64 => STANDARD
            .decode(value)
            .map_err(|e| BleError::InvalidParameter(format!("invalid base64 value: {e}"))),
        ValueEncoding::Hex => {
            let cleaned: String = value.chars().filter(|c| !c.is_whitespace()).collect();
            if cleaned.len() % 2 != 0 {
                return Err(BleError::InvalidParameter(
                    "hex value must have an even number of digits".into(),
                ));
            }
            hex::decode(&cleaned)
                .map_err(|e| BleError::InvalidParameter(format!("invalid hex value: {e}")))
        }
    }
}

/// Hex-encodes payload bytes for bridge results and events.
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}
