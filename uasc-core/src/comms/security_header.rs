// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The security and sequence headers carried by message chunks.
//!
//! These are plain wire structures. Whether the policy URI in an asymmetric
//! header is acceptable is decided where the chunk's security is removed,
//! not here.

use std::io::{Read, Write};

use uasc_types::{
    constants, read_u32, write_u32, ByteString, DecodingOptions, EncodingResult, Error,
    SimpleBinaryDecodable, SimpleBinaryEncodable, StatusCode, UAString,
};

use uasc_crypto::{SecurityPolicy, Thumbprint, X509};

use super::message_chunk::MessageChunkType;

/// The security header of a chunk. Open secure channel chunks carry the
/// asymmetric form, everything else the symmetric one.
#[derive(Debug, Clone, PartialEq)]
pub enum SecurityHeader {
    /// Security header for asymmetric encryption.
    Asymmetric(AsymmetricSecurityHeader),
    /// Security header for symmetric encryption.
    Symmetric(SymmetricSecurityHeader),
}

impl SecurityHeader {
    /// Decode the header matching the chunk type. The type of header is
    /// given by the message header, so this type doesn't implement
    /// `SimpleBinaryDecodable`.
    pub fn decode<S: Read + ?Sized>(
        stream: &mut S,
        message_type: MessageChunkType,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<SecurityHeader> {
        if message_type.is_open_secure_channel() {
            AsymmetricSecurityHeader::decode(stream, decoding_options).map(SecurityHeader::Asymmetric)
        } else {
            SymmetricSecurityHeader::decode(stream, decoding_options).map(SecurityHeader::Symmetric)
        }
    }
}

impl SimpleBinaryEncodable for SecurityHeader {
    fn byte_len(&self) -> usize {
        match self {
            SecurityHeader::Asymmetric(header) => header.byte_len(),
            SecurityHeader::Symmetric(header) => header.byte_len(),
        }
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        match self {
            SecurityHeader::Asymmetric(header) => header.encode(stream),
            SecurityHeader::Symmetric(header) => header.encode(stream),
        }
    }
}

/// Security header of an ordinary message chunk: just the token whose keys
/// secure it.
#[derive(Debug, Clone, PartialEq)]
pub struct SymmetricSecurityHeader {
    /// Security token ID.
    pub token_id: u32,
}

impl SimpleBinaryEncodable for SymmetricSecurityHeader {
    fn byte_len(&self) -> usize {
        4
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        write_u32(stream, self.token_id)
    }
}

impl SimpleBinaryDecodable for SymmetricSecurityHeader {
    fn decode<S: Read + ?Sized>(stream: &mut S, _: &DecodingOptions) -> EncodingResult<Self> {
        Ok(SymmetricSecurityHeader {
            token_id: read_u32(stream)?,
        })
    }
}

/// Security header of an open secure channel chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct AsymmetricSecurityHeader {
    /// Security policy URI.
    pub security_policy_uri: UAString,
    /// Sender certificate as a byte string.
    pub sender_certificate: ByteString,
    /// Thumbprint of the receiver certificate as a byte string.
    pub receiver_certificate_thumbprint: ByteString,
}

impl AsymmetricSecurityHeader {
    /// The header of an unsecured open secure channel chunk.
    pub fn none() -> AsymmetricSecurityHeader {
        AsymmetricSecurityHeader {
            security_policy_uri: UAString::from(SecurityPolicy::None.to_uri()),
            sender_certificate: ByteString::null(),
            receiver_certificate_thumbprint: ByteString::null(),
        }
    }

    /// The header of a secured open secure channel chunk.
    pub fn new(
        security_policy: SecurityPolicy,
        sender_certificate: &X509,
        receiver_certificate_thumbprint: ByteString,
    ) -> AsymmetricSecurityHeader {
        AsymmetricSecurityHeader {
            security_policy_uri: UAString::from(security_policy.to_uri()),
            sender_certificate: sender_certificate.as_byte_string(),
            receiver_certificate_thumbprint,
        }
    }
}

impl SimpleBinaryEncodable for AsymmetricSecurityHeader {
    fn byte_len(&self) -> usize {
        self.security_policy_uri.byte_len()
            + self.sender_certificate.byte_len()
            + self.receiver_certificate_thumbprint.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.security_policy_uri.encode(stream)?;
        self.sender_certificate.encode(stream)?;
        self.receiver_certificate_thumbprint.encode(stream)
    }
}

impl SimpleBinaryDecodable for AsymmetricSecurityHeader {
    fn decode<S: Read + ?Sized>(
        stream: &mut S,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self> {
        let security_policy_uri = UAString::decode(stream, decoding_options)?;
        let sender_certificate = ByteString::decode(stream, decoding_options)?;
        let receiver_certificate_thumbprint = ByteString::decode(stream, decoding_options)?;

        if sender_certificate.len() >= constants::MAX_CERTIFICATE_LENGTH {
            return Err(Error::new(
                StatusCode::BadEncodingLimitsExceeded,
                format!(
                    "Sender certificate of {} bytes exceeds the maximum certificate size {}",
                    sender_certificate.len(),
                    constants::MAX_CERTIFICATE_LENGTH
                ),
            ));
        }
        let thumbprint_len = receiver_certificate_thumbprint.len();
        if thumbprint_len != 0 && thumbprint_len != Thumbprint::THUMBPRINT_SIZE {
            return Err(Error::decoding(format!(
                "Receiver certificate thumbprint is {} bytes instead of {}",
                thumbprint_len,
                Thumbprint::THUMBPRINT_SIZE
            )));
        }

        Ok(AsymmetricSecurityHeader {
            security_policy_uri,
            sender_certificate,
            receiver_certificate_thumbprint,
        })
    }
}

/// The sequence header preceding a chunk's body: the chunk's sequence number
/// and the id of the request it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceHeader {
    /// Sequence number of the chunk.
    pub sequence_number: u32,
    /// ID of the request this chunk is part of.
    pub request_id: u32,
}

impl SimpleBinaryEncodable for SequenceHeader {
    fn byte_len(&self) -> usize {
        8
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        write_u32(stream, self.sequence_number)?;
        write_u32(stream, self.request_id)
    }
}

impl SimpleBinaryDecodable for SequenceHeader {
    fn decode<S: Read + ?Sized>(stream: &mut S, _: &DecodingOptions) -> EncodingResult<Self> {
        Ok(SequenceHeader {
            sequence_number: read_u32(stream)?,
            request_id: read_u32(stream)?,
        })
    }
}
