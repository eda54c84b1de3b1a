// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Contains the implementation of `RequestHeader`.

use std::io::{Read, Write};

use crate::date_time::DateTime;
use crate::encoding::{
    read_u32, write_u32, DecodingOptions, EncodingResult, SimpleBinaryDecodable,
    SimpleBinaryEncodable,
};
use crate::extension_object::ExtensionObject;
use crate::node_id::NodeId;
use crate::string::UAString;

/// The header passed with every service request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHeader {
    /// The session authentication token, null on the secure channel services.
    pub authentication_token: NodeId,
    /// The time the client sent the request.
    pub timestamp: DateTime,
    /// A requestHandle associated with the request. This client defined
    /// handle can be used to cancel the request. It is also returned in the
    /// response.
    pub request_handle: u32,
    /// A bit mask that identifies the types of vendor-specific diagnostics
    /// to be returned in diagnosticInfo response parameters.
    pub return_diagnostics: u32,
    /// An identifier that identifies the client's security audit log entry
    /// associated with this request.
    pub audit_entry_id: UAString,
    /// This timeout in milliseconds is used in the client side communication
    /// stack to set the timeout on a per-call basis.
    pub timeout_hint: u32,
    /// Reserved for future use.
    pub additional_header: ExtensionObject,
}

impl RequestHeader {
    /// Create a request header with the given handle and timestamp now.
    pub fn new(authentication_token: NodeId, request_handle: u32) -> RequestHeader {
        RequestHeader {
            authentication_token,
            timestamp: DateTime::now(),
            request_handle,
            return_diagnostics: 0,
            audit_entry_id: UAString::null(),
            timeout_hint: 0,
            additional_header: ExtensionObject::null(),
        }
    }
}

impl SimpleBinaryEncodable for RequestHeader {
    fn byte_len(&self) -> usize {
        self.authentication_token.byte_len()
            + self.timestamp.byte_len()
            + 4
            + 4
            + self.audit_entry_id.byte_len()
            + 4
            + self.additional_header.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.authentication_token.encode(stream)?;
        self.timestamp.encode(stream)?;
        write_u32(stream, self.request_handle)?;
        write_u32(stream, self.return_diagnostics)?;
        self.audit_entry_id.encode(stream)?;
        write_u32(stream, self.timeout_hint)?;
        self.additional_header.encode(stream)
    }
}

impl SimpleBinaryDecodable for RequestHeader {
    fn decode<S: Read + ?Sized>(
        stream: &mut S,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self> {
        Ok(RequestHeader {
            authentication_token: NodeId::decode(stream, decoding_options)?,
            timestamp: DateTime::decode(stream, decoding_options)?,
            request_handle: read_u32(stream)?,
            return_diagnostics: read_u32(stream)?,
            audit_entry_id: UAString::decode(stream, decoding_options)?,
            timeout_hint: read_u32(stream)?,
            additional_header: ExtensionObject::decode(stream, decoding_options)?,
        })
    }
}
