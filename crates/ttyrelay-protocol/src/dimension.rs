//! Terminal dimensions on the wire.
//!
//! Columns and rows travel as three-digit zero-padded strings (`"040"`,
//! `"024"`). Input is lenient: unpadded strings and plain JSON numbers are
//! accepted too, as long as the value lies in `1..=999`.

use serde::{de, Deserialize, Deserializer, Serializer};

use crate::error::ProtocolError;

pub const MAX_DIMENSION: u16 = 999;

/// Render a dimension as its three-digit wire form.
pub fn encode(value: u16) -> String {
    format!("{:03}", value)
}

/// Parse a textual dimension, tolerating zero padding and surrounding spaces.
pub fn parse(text: &str) -> Result<u16, ProtocolError> {
    let trimmed = text.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::InvalidDimension {
            value: text.to_string(),
            reason: "expected decimal digits",
        });
    }
    // Strip padding before parsing so very long zero runs cannot overflow.
    let digits = trimmed.trim_start_matches('0');
    if digits.len() > 3 {
        return Err(ProtocolError::InvalidDimension {
            value: text.to_string(),
            reason: "larger than 999",
        });
    }
    let value = if digits.is_empty() {
        0
    } else {
        digits.parse::<u16>().map_err(|_| ProtocolError::InvalidDimension {
            value: text.to_string(),
            reason: "expected decimal digits",
        })?
    };
    check(value).map_err(|reason| ProtocolError::InvalidDimension {
        value: text.to_string(),
        reason,
    })
}

fn check(value: u16) -> Result<u16, &'static str> {
    match value {
        0 => Err("must be non-zero"),
        v if v > MAX_DIMENSION => Err("larger than 999"),
        v => Ok(v),
    }
}

/// `#[serde(with = "crate::dimension")]` adapter.
pub fn serialize<S: Serializer>(value: &u16, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&encode(*value))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Text(text) => parse(&text).map_err(de::Error::custom),
        Raw::Number(n) => {
            let n = u16::try_from(n).map_err(|_| de::Error::custom("dimension larger than 999"))?;
            check(n).map_err(de::Error::custom)
        }
    }
}
