// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Contains the implementation of `DiagnosticInfo`.

use std::io::{Read, Write};

use crate::encoding::{
    read_i32, read_u32, read_u8, write_u8, DecodingOptions, EncodingResult,
    SimpleBinaryDecodable, SimpleBinaryEncodable,
};
use crate::string::UAString;

// Encoding mask bits
const HAS_SYMBOLIC_ID: u8 = 0x01;
const HAS_NAMESPACE: u8 = 0x02;
const HAS_LOCALIZED_TEXT: u8 = 0x04;
const HAS_LOCALE: u8 = 0x08;
const HAS_ADDITIONAL_INFO: u8 = 0x10;
const HAS_INNER_STATUS_CODE: u8 = 0x20;
const HAS_INNER_DIAGNOSTIC_INFO: u8 = 0x40;

/// Diagnostic information for a response. The secure channel layer only ever
/// writes the null form; inbound values are consumed and dropped without
/// interpretation so that a peer sending diagnostics doesn't break decoding.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct DiagnosticInfo;

impl DiagnosticInfo {
    /// The null diagnostic info.
    pub fn null() -> DiagnosticInfo {
        DiagnosticInfo
    }

    fn skip<S: Read + ?Sized>(
        stream: &mut S,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<()> {
        let mask = read_u8(stream)?;
        if mask & HAS_SYMBOLIC_ID != 0 {
            let _ = read_i32(stream)?;
        }
        if mask & HAS_NAMESPACE != 0 {
            let _ = read_i32(stream)?;
        }
        if mask & HAS_LOCALE != 0 {
            let _ = read_i32(stream)?;
        }
        if mask & HAS_LOCALIZED_TEXT != 0 {
            let _ = read_i32(stream)?;
        }
        if mask & HAS_ADDITIONAL_INFO != 0 {
            let _ = UAString::decode(stream, decoding_options)?;
        }
        if mask & HAS_INNER_STATUS_CODE != 0 {
            let _ = read_u32(stream)?;
        }
        if mask & HAS_INNER_DIAGNOSTIC_INFO != 0 {
            Self::skip(stream, decoding_options)?;
        }
        Ok(())
    }
}

impl SimpleBinaryEncodable for DiagnosticInfo {
    fn byte_len(&self) -> usize {
        1
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        write_u8(stream, 0u8)
    }
}

impl SimpleBinaryDecodable for DiagnosticInfo {
    fn decode<S: Read + ?Sized>(
        stream: &mut S,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self> {
        Self::skip(stream, decoding_options)?;
        Ok(DiagnosticInfo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn null_round_trip() {
        let mut stream = Cursor::new(Vec::new());
        DiagnosticInfo::null().encode(&mut stream).unwrap();
        assert_eq!(stream.get_ref().as_slice(), &[0u8]);
        let mut stream = Cursor::new(stream.into_inner());
        assert!(DiagnosticInfo::decode(&mut stream, &DecodingOptions::test()).is_ok());
    }

    #[test]
    fn skips_populated_info() {
        // symbolic id + inner status code
        let mut bytes = vec![HAS_SYMBOLIC_ID | HAS_INNER_STATUS_CODE];
        bytes.extend_from_slice(&7i32.to_le_bytes());
        bytes.extend_from_slice(&0x8005_0000u32.to_le_bytes());
        // trailing marker to prove the decoder consumed exactly the right bytes
        bytes.push(0xEE);
        let mut stream = Cursor::new(bytes);
        DiagnosticInfo::decode(&mut stream, &DecodingOptions::test()).unwrap();
        assert_eq!(read_u8(&mut stream).unwrap(), 0xEE);
    }
}
