//! Binary blobs ride the JSON protocol as standard base-64 text.

use base64::engine::general_purpose::STANDARD;
use base64::{DecodeError, Engine as _};

pub fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn decode(text: &str) -> Result<Vec<u8>, DecodeError> {
    STANDARD.decode(text)
}
