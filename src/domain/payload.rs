//! Will payload decoding
//!
//! A configured payload is either literal text or a run of `\xHH` escapes.
//! Escaped input is decoded greedily; anything after the first byte that does
//! not parse is dropped and reported as a warning.

use crate::infra::error::PayloadParseWarning;
use bytes::Bytes;

const ESCAPE_PREFIX: &str = "\\x";

/// Decoded payload plus an optional warning for trailing garbage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPayload {
    pub bytes: Bytes,
    pub warning: Option<PayloadParseWarning>,
}

pub fn decode_payload(input: &str) -> DecodedPayload {
    if !input.starts_with(ESCAPE_PREFIX) {
        return DecodedPayload { bytes: Bytes::copy_from_slice(input.as_bytes()), warning: None };
    }

    let mut out = Vec::with_capacity(input.len() / 4);
    let mut rest = input;

    while !rest.is_empty() {
        let Some(digits) = rest.strip_prefix(ESCAPE_PREFIX) else {
            break;
        };
        let Some(pair) = digits.get(..2) else {
            break;
        };
        match hex::decode(pair) {
            Ok(byte) => out.extend_from_slice(&byte),
            Err(_) => break,
        }
        rest = &digits[2..];
    }

    let warning = (!rest.is_empty()).then(|| PayloadParseWarning {
        offset: input.len() - rest.len(),
        remainder: rest.to_string(),
    });

    DecodedPayload { bytes: Bytes::from(out), warning }
}
