// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Contains the implementation of `ResponseHeader`.

use std::io::{Read, Write};

use crate::date_time::DateTime;
use crate::diagnostic_info::DiagnosticInfo;
use crate::encoding::{
    read_array, read_u32, write_array, write_u32, DecodingOptions, EncodingResult,
    SimpleBinaryDecodable, SimpleBinaryEncodable,
};
use crate::extension_object::ExtensionObject;
use crate::request_header::RequestHeader;
use crate::status_code::StatusCode;
use crate::string::UAString;

/// The header passed with every service response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHeader {
    /// The time the server sent the response.
    pub timestamp: DateTime,
    /// The handle of the request this response answers, copied verbatim
    /// from the request header.
    pub request_handle: u32,
    /// The overall result of the service call.
    pub service_result: StatusCode,
    /// Diagnostics for the service result, null unless requested.
    pub service_diagnostics: DiagnosticInfo,
    /// A table of strings referenced by the diagnostics.
    pub string_table: Option<Vec<UAString>>,
    /// Reserved for future use.
    pub additional_header: ExtensionObject,
}

/// Anything a request handle can be pulled out of, so response constructors
/// take either the original request header or a bare handle.
pub trait AsRequestHandle {
    /// Get the request handle.
    fn as_request_handle(&self) -> u32;
}

impl AsRequestHandle for &RequestHeader {
    fn as_request_handle(&self) -> u32 {
        self.request_handle
    }
}

impl AsRequestHandle for u32 {
    fn as_request_handle(&self) -> u32 {
        *self
    }
}

impl ResponseHeader {
    /// A response header for a successful call.
    pub fn new_good(request_header: impl AsRequestHandle) -> ResponseHeader {
        ResponseHeader::new_service_result(request_header, StatusCode::Good)
    }

    /// A response header with the given service result.
    pub fn new_service_result(
        request_header: impl AsRequestHandle,
        service_result: StatusCode,
    ) -> ResponseHeader {
        ResponseHeader {
            timestamp: DateTime::now(),
            request_handle: request_header.as_request_handle(),
            service_result,
            service_diagnostics: DiagnosticInfo::null(),
            string_table: None,
            additional_header: ExtensionObject::null(),
        }
    }

    /// An entirely null response header.
    pub fn null() -> ResponseHeader {
        ResponseHeader {
            timestamp: DateTime::null(),
            request_handle: 0,
            service_result: StatusCode::Good,
            service_diagnostics: DiagnosticInfo::null(),
            string_table: None,
            additional_header: ExtensionObject::null(),
        }
    }
}

impl SimpleBinaryEncodable for ResponseHeader {
    fn byte_len(&self) -> usize {
        self.timestamp.byte_len()
            + 4
            + self.service_result.byte_len()
            + self.service_diagnostics.byte_len()
            + crate::encoding::array_byte_len(&self.string_table)
            + self.additional_header.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.timestamp.encode(stream)?;
        write_u32(stream, self.request_handle)?;
        self.service_result.encode(stream)?;
        self.service_diagnostics.encode(stream)?;
        write_array(stream, &self.string_table)?;
        self.additional_header.encode(stream)
    }
}

impl SimpleBinaryDecodable for ResponseHeader {
    fn decode<S: Read + ?Sized>(
        stream: &mut S,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self> {
        Ok(ResponseHeader {
            timestamp: DateTime::decode(stream, decoding_options)?,
            request_handle: read_u32(stream)?,
            service_result: StatusCode::decode(stream, decoding_options)?,
            service_diagnostics: DiagnosticInfo::decode(stream, decoding_options)?,
            string_table: read_array(stream, decoding_options)?,
            additional_header: ExtensionObject::decode(stream, decoding_options)?,
        })
    }
}
