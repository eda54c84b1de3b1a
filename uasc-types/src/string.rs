// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Contains the implementation of `UAString`.

use std::fmt;
use std::io::{Read, Write};

use crate::encoding::{
    process_decode_io_result, read_i32, write_i32, DecodingOptions, EncodingResult, Error,
    SimpleBinaryDecodable, SimpleBinaryEncodable,
};

/// An OPC-UA string is a UTF-8 string which may also have a null value, which
/// is distinct from being empty.
#[derive(Eq, PartialEq, Debug, Clone, Hash, Default)]
pub struct UAString {
    /// The inner string value, or `None` for null.
    pub value: Option<String>,
}

impl UAString {
    /// The null string.
    pub fn null() -> UAString {
        UAString { value: None }
    }

    /// `true` if the string is null.
    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }

    /// `true` if the string is null or empty.
    pub fn is_empty(&self) -> bool {
        self.value.as_ref().map_or(true, |v| v.is_empty())
    }

    /// The byte length of the string, or -1 for null.
    pub fn len(&self) -> isize {
        self.value.as_ref().map_or(-1, |v| v.len() as isize)
    }
}

impl AsRef<str> for UAString {
    fn as_ref(&self) -> &str {
        self.value.as_deref().unwrap_or("")
    }
}

impl fmt::Display for UAString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Some(ref value) => write!(f, "{}", value),
            None => write!(f, "[null]"),
        }
    }
}

impl From<&str> for UAString {
    fn from(value: &str) -> Self {
        UAString {
            value: Some(value.to_string()),
        }
    }
}

impl From<String> for UAString {
    fn from(value: String) -> Self {
        UAString { value: Some(value) }
    }
}

impl SimpleBinaryEncodable for UAString {
    fn byte_len(&self) -> usize {
        4 + self.value.as_ref().map_or(0, |v| v.len())
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        match self.value {
            Some(ref value) => {
                write_i32(stream, value.len() as i32)?;
                crate::encoding::process_encode_io_result(stream.write_all(value.as_bytes()))
            }
            None => write_i32(stream, -1),
        }
    }
}

impl SimpleBinaryDecodable for UAString {
    fn decode<S: Read + ?Sized>(
        stream: &mut S,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self> {
        let len = read_i32(stream)?;
        if len < 0 {
            return Ok(UAString::null());
        }
        let len = len as usize;
        if len > decoding_options.max_string_length {
            return Err(Error::decoding(format!(
                "String length {} exceeds decoding limit {}",
                len, decoding_options.max_string_length
            )));
        }
        let mut buf = vec![0u8; len];
        process_decode_io_result(stream.read_exact(&mut buf))?;
        let value = String::from_utf8(buf)
            .map_err(|_| Error::decoding("String is not valid UTF-8"))?;
        Ok(UAString { value: Some(value) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(s: &UAString) -> UAString {
        let mut stream = Cursor::new(Vec::new());
        s.encode(&mut stream).unwrap();
        assert_eq!(stream.get_ref().len(), s.byte_len());
        let mut stream = Cursor::new(stream.into_inner());
        UAString::decode(&mut stream, &DecodingOptions::test()).unwrap()
    }

    #[test]
    fn null_vs_empty() {
        assert_eq!(round_trip(&UAString::null()), UAString::null());
        let empty = UAString::from("");
        assert_eq!(round_trip(&empty), empty);
        assert_ne!(UAString::null(), empty);
        assert!(UAString::null().is_empty());
        assert!(empty.is_empty());
    }

    #[test]
    fn length_limit() {
        let s = UAString::from("this string is too long");
        let mut stream = Cursor::new(Vec::new());
        s.encode(&mut stream).unwrap();
        let options = DecodingOptions {
            max_string_length: 4,
            ..Default::default()
        };
        let mut stream = Cursor::new(stream.into_inner());
        assert!(UAString::decode(&mut stream, &options).is_err());
    }
}
