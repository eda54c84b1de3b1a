// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Contains the implementation of `NodeId` and the object ids the secure
//! channel layer encodes messages with.
//!
//! The channel layer only ever reads and writes numeric node ids - the
//! binary encoding ids of the service messages. String, GUID and byte string
//! identifiers are rejected when decoding.

use std::fmt;
use std::io::{Read, Write};

use crate::encoding::{
    read_u16, read_u32, read_u8, write_u16, write_u32, write_u8, DecodingOptions, EncodingResult,
    Error, SimpleBinaryDecodable, SimpleBinaryEncodable,
};

/// A numeric OPC-UA node id.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Default)]
pub struct NodeId {
    /// Namespace index of the id.
    pub namespace: u16,
    /// Numeric identifier within the namespace.
    pub value: u32,
}

// Node id encoding byte values for the numeric forms.
const NODE_ID_TWO_BYTE: u8 = 0x00;
const NODE_ID_FOUR_BYTE: u8 = 0x01;
const NODE_ID_NUMERIC: u8 = 0x02;

impl NodeId {
    /// Create a new numeric node id.
    pub fn new(namespace: u16, value: u32) -> NodeId {
        NodeId { namespace, value }
    }

    /// The null node id, `ns=0;i=0`.
    pub fn null() -> NodeId {
        NodeId::default()
    }

    /// `true` if this is the null node id.
    pub fn is_null(&self) -> bool {
        self.namespace == 0 && self.value == 0
    }

    /// Try to interpret this node id as a known object id.
    pub fn as_object_id(&self) -> Result<ObjectId, ()> {
        if self.namespace != 0 {
            return Err(());
        }
        ObjectId::from_u32(self.value).ok_or(())
    }
}

impl From<ObjectId> for NodeId {
    fn from(value: ObjectId) -> Self {
        NodeId::new(0, value as u32)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace == 0 {
            write!(f, "i={}", self.value)
        } else {
            write!(f, "ns={};i={}", self.namespace, self.value)
        }
    }
}

impl SimpleBinaryEncodable for NodeId {
    fn byte_len(&self) -> usize {
        if self.namespace == 0 && self.value <= u8::MAX as u32 {
            2
        } else if self.namespace <= u8::MAX as u16 && self.value <= u16::MAX as u32 {
            4
        } else {
            7
        }
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        if self.namespace == 0 && self.value <= u8::MAX as u32 {
            write_u8(stream, NODE_ID_TWO_BYTE)?;
            write_u8(stream, self.value as u8)
        } else if self.namespace <= u8::MAX as u16 && self.value <= u16::MAX as u32 {
            write_u8(stream, NODE_ID_FOUR_BYTE)?;
            write_u8(stream, self.namespace as u8)?;
            write_u16(stream, self.value as u16)
        } else {
            write_u8(stream, NODE_ID_NUMERIC)?;
            write_u16(stream, self.namespace)?;
            write_u32(stream, self.value)
        }
    }
}

impl SimpleBinaryDecodable for NodeId {
    fn decode<S: Read + ?Sized>(stream: &mut S, _: &DecodingOptions) -> EncodingResult<Self> {
        let encoding = read_u8(stream)?;
        match encoding {
            NODE_ID_TWO_BYTE => Ok(NodeId::new(0, read_u8(stream)? as u32)),
            NODE_ID_FOUR_BYTE => {
                let namespace = read_u8(stream)? as u16;
                let value = read_u16(stream)? as u32;
                Ok(NodeId::new(namespace, value))
            }
            NODE_ID_NUMERIC => {
                let namespace = read_u16(stream)?;
                let value = read_u32(stream)?;
                Ok(NodeId::new(namespace, value))
            }
            r => Err(Error::decoding(format!(
                "Unsupported node id encoding {:#04x}, only numeric ids are handled here",
                r
            ))),
        }
    }
}

macro_rules! object_ids {
    ($($name:ident = $value:literal),*,) => {
        /// Object ids for the binary encodings of the service messages the
        /// channel layer handles.
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        #[repr(u32)]
        #[allow(non_camel_case_types, missing_docs)]
        pub enum ObjectId {
            $( $name = $value, )*
        }

        impl ObjectId {
            /// Look up an object id from its numeric value.
            pub fn from_u32(value: u32) -> Option<ObjectId> {
                match value {
                    $( $value => Some(ObjectId::$name), )*
                    _ => None,
                }
            }
        }
    };
}

object_ids! {
    ServiceFault_Encoding_DefaultBinary = 397,
    OpenSecureChannelRequest_Encoding_DefaultBinary = 446,
    OpenSecureChannelResponse_Encoding_DefaultBinary = 449,
    CloseSecureChannelRequest_Encoding_DefaultBinary = 452,
    CloseSecureChannelResponse_Encoding_DefaultBinary = 455,
    CancelRequest_Encoding_DefaultBinary = 479,
    CancelResponse_Encoding_DefaultBinary = 482,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(id: NodeId) {
        let mut stream = Cursor::new(Vec::new());
        id.encode(&mut stream).unwrap();
        assert_eq!(stream.get_ref().len(), id.byte_len());
        let mut stream = Cursor::new(stream.into_inner());
        let decoded = NodeId::decode(&mut stream, &DecodingOptions::test()).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn numeric_forms() {
        round_trip(NodeId::null());
        round_trip(NodeId::new(0, 255)); // two byte limit
        round_trip(NodeId::new(0, 256)); // four byte
        round_trip(NodeId::new(3, 1025));
        round_trip(NodeId::new(300, 70_000)); // full numeric
    }

    #[test]
    fn object_id_mapping() {
        let id = NodeId::from(ObjectId::OpenSecureChannelRequest_Encoding_DefaultBinary);
        assert_eq!(id.value, 446);
        assert_eq!(
            id.as_object_id().unwrap(),
            ObjectId::OpenSecureChannelRequest_Encoding_DefaultBinary
        );
        assert!(NodeId::new(0, 12345).as_object_id().is_err());
        assert!(NodeId::new(2, 446).as_object_id().is_err());
    }

    #[test]
    fn rejects_non_numeric() {
        // 0x03 is the string node id encoding
        let mut stream = Cursor::new(vec![0x03u8, 0, 0, 0, 0]);
        assert!(NodeId::decode(&mut stream, &DecodingOptions::test()).is_err());
    }
}
