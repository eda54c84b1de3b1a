// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Contains the implementation of `ExtensionObject`.

use std::io::{Read, Write};

use crate::byte_string::ByteString;
use crate::encoding::{
    read_u8, write_u8, DecodingOptions, EncodingResult, Error, SimpleBinaryDecodable,
    SimpleBinaryEncodable,
};
use crate::node_id::NodeId;

const BODY_NONE: u8 = 0x00;
const BODY_BYTE_STRING: u8 = 0x01;

/// An extension object carries an encoded structure identified by node id.
/// The channel layer never interprets extension object bodies - request and
/// response headers carry them as opaque payloads, normally null.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct ExtensionObject {
    /// Node id of the body's encoding.
    pub node_id: NodeId,
    /// The undecoded body, if one is present.
    pub body: Option<Vec<u8>>,
}

impl ExtensionObject {
    /// An extension object with no body.
    pub fn null() -> ExtensionObject {
        ExtensionObject::default()
    }

    /// `true` if there is no body.
    pub fn is_null(&self) -> bool {
        self.body.is_none()
    }
}

impl SimpleBinaryEncodable for ExtensionObject {
    fn byte_len(&self) -> usize {
        self.node_id.byte_len() + 1 + self.body.as_ref().map_or(0, |b| 4 + b.len())
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.node_id.encode(stream)?;
        match &self.body {
            Some(body) => {
                write_u8(stream, BODY_BYTE_STRING)?;
                ByteString::from(body).encode(stream)
            }
            None => write_u8(stream, BODY_NONE),
        }
    }
}

impl SimpleBinaryDecodable for ExtensionObject {
    fn decode<S: Read + ?Sized>(
        stream: &mut S,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self> {
        let node_id = NodeId::decode(stream, decoding_options)?;
        let encoding = read_u8(stream)?;
        let body = match encoding {
            BODY_NONE => None,
            BODY_BYTE_STRING => ByteString::decode(stream, decoding_options)?.value,
            r => {
                // XML bodies (0x02) have no place on a binary channel
                return Err(Error::decoding(format!(
                    "Unsupported extension object body encoding {:#04x}",
                    r
                )));
            }
        };
        Ok(ExtensionObject { node_id, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn null_round_trip() {
        let eo = ExtensionObject::null();
        let mut stream = Cursor::new(Vec::new());
        eo.encode(&mut stream).unwrap();
        // two byte node id + encoding byte
        assert_eq!(stream.get_ref().len(), 3);
        let mut stream = Cursor::new(stream.into_inner());
        let decoded = ExtensionObject::decode(&mut stream, &DecodingOptions::test()).unwrap();
        assert!(decoded.is_null());
    }

    #[test]
    fn opaque_body_round_trip() {
        let eo = ExtensionObject {
            node_id: NodeId::new(0, 299),
            body: Some(vec![9, 8, 7]),
        };
        let mut stream = Cursor::new(Vec::new());
        eo.encode(&mut stream).unwrap();
        assert_eq!(stream.get_ref().len(), eo.byte_len());
        let mut stream = Cursor::new(stream.into_inner());
        let decoded = ExtensionObject::decode(&mut stream, &DecodingOptions::test()).unwrap();
        assert_eq!(decoded, eo);
    }
}
