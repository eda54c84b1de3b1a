// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! OPC-UA status codes, reduced to the set the secure channel layer surfaces.

use std::fmt;
use std::io::{Read, Write};

use crate::encoding::{
    read_u32, write_u32, DecodingOptions, EncodingResult, SimpleBinaryDecodable,
    SimpleBinaryEncodable,
};

/// An OPC-UA status code. The top two bits hold the severity, the rest
/// identify the condition. Unknown bit patterns are carried through untouched
/// so codes decode losslessly.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StatusCode(u32);

macro_rules! status_codes {
    ($($name:ident = $value:literal, $doc:literal);* ;) => {
        impl StatusCode {
            $(
                #[doc = $doc]
                pub const $name: StatusCode = StatusCode($value);
            )*

            /// The symbolic name of this code, or `None` if the value is not
            /// one this stack defines.
            pub fn name(&self) -> Option<&'static str> {
                match self.0 {
                    $( $value => Some(stringify!($name)), )*
                    _ => None,
                }
            }
        }
    };
}

status_codes! {
    Good = 0x0000_0000, "The operation succeeded.";
    BadUnexpectedError = 0x8001_0000, "An unexpected error occurred.";
    BadInternalError = 0x8002_0000, "An internal error occurred as a result of a programming or configuration error.";
    BadOutOfMemory = 0x8003_0000, "Not enough memory to complete the operation.";
    BadCommunicationError = 0x8005_0000, "A low level communication error occurred.";
    BadEncodingError = 0x8006_0000, "Encoding halted because of invalid data in the objects being serialized.";
    BadDecodingError = 0x8007_0000, "Decoding halted because of invalid data in the stream.";
    BadEncodingLimitsExceeded = 0x8008_0000, "The message encoding/decoding limits imposed by the stack have been exceeded.";
    BadRequestTooLarge = 0x80B8_0000, "The request message size exceeds limits set by the server.";
    BadResponseTooLarge = 0x80B9_0000, "The response message size exceeds limits set by the client.";
    BadTimeout = 0x800A_0000, "The operation timed out.";
    BadServiceUnsupported = 0x800B_0000, "The server does not support the requested service.";
    BadShutdown = 0x800C_0000, "The operation was cancelled because the application is shutting down.";
    BadServerHalted = 0x800E_0000, "The server has stopped and cannot process any requests.";
    BadNothingToDo = 0x800F_0000, "No processing could be done because there was nothing to do.";
    BadCertificateInvalid = 0x8012_0000, "The certificate provided as a parameter is not valid.";
    BadSecurityChecksFailed = 0x8013_0000, "An error occurred verifying security.";
    BadCertificateTimeInvalid = 0x8014_0000, "The certificate has expired or is not yet valid.";
    BadCertificateUntrusted = 0x801A_0000, "The certificate is not trusted.";
    BadSecureChannelIdInvalid = 0x8022_0000, "The specified secure channel is no longer valid.";
    BadInvalidTimestamp = 0x8023_0000, "The timestamp is outside the range allowed by the server.";
    BadNonceInvalid = 0x8024_0000, "The nonce does appear to be not a random value or it is not the correct length.";
    BadSecurityModeRejected = 0x8054_0000, "The security mode does not meet the requirements set by the server.";
    BadSecurityPolicyRejected = 0x8055_0000, "The security policy does not meet the requirements set by the server.";
    BadNoValidCertificates = 0x8059_0000, "The operation could not be completed because no valid certificates were found.";
    BadTcpMessageTypeInvalid = 0x807E_0000, "The type of the message specified in the header is invalid.";
    BadTcpSecureChannelUnknown = 0x807F_0000, "The secure channel id is not known to the server.";
    BadTcpMessageTooLarge = 0x8080_0000, "The size of the message chunk specified in the header is too large.";
    BadTcpInternalError = 0x8082_0000, "An internal error occurred in the transport layer.";
    BadTcpEndpointUrlInvalid = 0x8083_0000, "The server does not recognize the endpoint url.";
    BadRequestInterrupted = 0x8084_0000, "The request could not be sent because of a network interruption.";
    BadRequestTimeout = 0x8085_0000, "Timeout occurred while processing the request.";
    BadSecureChannelClosed = 0x8086_0000, "The secure channel has been closed.";
    BadSecureChannelTokenUnknown = 0x8087_0000, "The token has expired or is not recognized.";
    BadSequenceNumberInvalid = 0x8088_0000, "The sequence number is not valid.";
    BadProtocolVersionUnsupported = 0x80BE_0000, "The applications do not have compatible protocol versions.";
    BadConnectionClosed = 0x80AE_0000, "The network connection has been closed.";
    BadInvalidState = 0x80AF_0000, "The operation cannot be completed because the object is closed, uninitialized or in some other invalid state.";
}

impl StatusCode {
    const SEVERITY_MASK: u32 = 0xC000_0000;
    const SEVERITY_BAD: u32 = 0x8000_0000;
    const SEVERITY_UNCERTAIN: u32 = 0x4000_0000;

    /// Create a status code from raw bits.
    pub fn from_bits(bits: u32) -> StatusCode {
        StatusCode(bits)
    }

    /// The raw numeric value of this code.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// `true` if the severity is good.
    pub fn is_good(&self) -> bool {
        self.0 & Self::SEVERITY_MASK == 0
    }

    /// `true` if the severity is bad.
    pub fn is_bad(&self) -> bool {
        self.0 & Self::SEVERITY_BAD != 0
    }

    /// `true` if the severity is uncertain.
    pub fn is_uncertain(&self) -> bool {
        self.0 & Self::SEVERITY_MASK == Self::SEVERITY_UNCERTAIN
    }
}

impl Default for StatusCode {
    fn default() -> Self {
        StatusCode::Good
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "StatusCode({:#010X})", self.0),
        }
    }
}

impl From<StatusCode> for std::io::Error {
    fn from(value: StatusCode) -> Self {
        std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("StatusCode {}", value),
        )
    }
}

impl SimpleBinaryEncodable for StatusCode {
    fn byte_len(&self) -> usize {
        4
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        write_u32(stream, self.0)
    }
}

impl SimpleBinaryDecodable for StatusCode {
    fn decode<S: Read + ?Sized>(stream: &mut S, _: &DecodingOptions) -> EncodingResult<Self> {
        Ok(StatusCode(read_u32(stream)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity() {
        assert!(StatusCode::Good.is_good());
        assert!(!StatusCode::Good.is_bad());
        assert!(StatusCode::BadSecurityPolicyRejected.is_bad());
        assert!(!StatusCode::BadSecurityPolicyRejected.is_good());
        assert!(StatusCode::from_bits(0x4000_0000).is_uncertain());
    }

    #[test]
    fn names() {
        assert_eq!(StatusCode::Good.to_string(), "Good");
        assert_eq!(
            StatusCode::BadCertificateTimeInvalid.to_string(),
            "BadCertificateTimeInvalid"
        );
        // Unknown codes round trip through their raw value
        let unknown = StatusCode::from_bits(0x8123_4567);
        assert_eq!(unknown.name(), None);
        assert_eq!(unknown.bits(), 0x8123_4567);
    }
}
