// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

#![warn(missing_docs)]

//! Binary types used on an OPC-UA secure channel: the encoding traits,
//! status codes, scalar wrappers and the handful of service messages the
//! channel layer itself produces and consumes.

/// Limits used as defaults for decoding options.
pub mod constants {
    /// Maximum size of a message in bytes.
    pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;
    /// Maximum number of chunks in a message.
    pub const MAX_CHUNK_COUNT: usize = 64;
    /// Maximum length in bytes of a string.
    pub const MAX_STRING_LENGTH: usize = 65536;
    /// Maximum length in bytes of a byte string.
    pub const MAX_BYTE_STRING_LENGTH: usize = 65536;
    /// Maximum number of array elements.
    pub const MAX_ARRAY_LENGTH: usize = 65536;
    /// Maximum length in bytes of a DER encoded certificate.
    pub const MAX_CERTIFICATE_LENGTH: usize = 32768;
}

pub mod byte_string;
pub mod date_time;
pub mod diagnostic_info;
pub mod encoding;
pub mod extension_object;
pub mod node_id;
pub mod request_header;
pub mod response_header;
pub mod service_types;
pub mod status_code;
pub mod string;

pub use byte_string::ByteString;
pub use date_time::DateTime;
pub use diagnostic_info::DiagnosticInfo;
pub use encoding::{
    process_decode_io_result, process_encode_io_result, read_array, read_bytes, read_i32, read_i64,
    read_u32, read_u8, write_array, write_bytes, write_i32, write_i64, write_u32, write_u8,
    DecodingOptions, EncodingResult, Error, SimpleBinaryDecodable, SimpleBinaryEncodable,
};
pub use extension_object::ExtensionObject;
pub use node_id::{NodeId, ObjectId};
pub use request_header::RequestHeader;
pub use response_header::{AsRequestHandle, ResponseHeader};
pub use service_types::{
    CancelRequest, CancelResponse, ChannelSecurityToken, CloseSecureChannelRequest,
    CloseSecureChannelResponse, MessageSecurityMode, OpenSecureChannelRequest,
    OpenSecureChannelResponse, SecurityTokenRequestType, ServiceFault,
};
pub use status_code::StatusCode;
pub use string::UAString;
