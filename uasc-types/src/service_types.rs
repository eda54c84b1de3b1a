// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The service messages the secure channel layer produces and consumes:
//! open / close secure channel, cancel, and the generic service fault.

use std::fmt;
use std::io::{Read, Write};

use crate::byte_string::ByteString;
use crate::date_time::DateTime;
use crate::encoding::{
    read_i32, read_u32, write_i32, write_u32, DecodingOptions, EncodingResult, Error,
    SimpleBinaryDecodable, SimpleBinaryEncodable,
};
use crate::request_header::RequestHeader;
use crate::response_header::ResponseHeader;

/// The security mode of a secure channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageSecurityMode {
    /// Mode is invalid. The initial value of a channel before its first
    /// open request, never valid on the wire.
    Invalid,
    /// No security applied to messages.
    None,
    /// Messages are signed but not encrypted.
    Sign,
    /// Messages are signed and encrypted.
    SignAndEncrypt,
}

impl MessageSecurityMode {
    fn from_i32(value: i32) -> MessageSecurityMode {
        match value {
            1 => MessageSecurityMode::None,
            2 => MessageSecurityMode::Sign,
            3 => MessageSecurityMode::SignAndEncrypt,
            _ => MessageSecurityMode::Invalid,
        }
    }
}

impl fmt::Display for MessageSecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageSecurityMode::Invalid => "Invalid",
            MessageSecurityMode::None => "None",
            MessageSecurityMode::Sign => "Sign",
            MessageSecurityMode::SignAndEncrypt => "SignAndEncrypt",
        };
        write!(f, "{}", s)
    }
}

impl From<&str> for MessageSecurityMode {
    fn from(value: &str) -> Self {
        match value {
            "None" => MessageSecurityMode::None,
            "Sign" => MessageSecurityMode::Sign,
            "SignAndEncrypt" => MessageSecurityMode::SignAndEncrypt,
            _ => MessageSecurityMode::Invalid,
        }
    }
}

impl SimpleBinaryEncodable for MessageSecurityMode {
    fn byte_len(&self) -> usize {
        4
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        let value = match self {
            MessageSecurityMode::Invalid => 0,
            MessageSecurityMode::None => 1,
            MessageSecurityMode::Sign => 2,
            MessageSecurityMode::SignAndEncrypt => 3,
        };
        write_i32(stream, value)
    }
}

impl SimpleBinaryDecodable for MessageSecurityMode {
    fn decode<S: Read + ?Sized>(stream: &mut S, _: &DecodingOptions) -> EncodingResult<Self> {
        Ok(MessageSecurityMode::from_i32(read_i32(stream)?))
    }
}

/// Whether an open secure channel request issues the first token on a
/// channel or renews an existing one.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SecurityTokenRequestType {
    /// Creates a new security token for a new secure channel.
    Issue,
    /// Creates a new security token for an existing secure channel.
    Renew,
}

impl SimpleBinaryEncodable for SecurityTokenRequestType {
    fn byte_len(&self) -> usize {
        4
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        write_i32(
            stream,
            match self {
                SecurityTokenRequestType::Issue => 0,
                SecurityTokenRequestType::Renew => 1,
            },
        )
    }
}

impl SimpleBinaryDecodable for SecurityTokenRequestType {
    fn decode<S: Read + ?Sized>(stream: &mut S, _: &DecodingOptions) -> EncodingResult<Self> {
        match read_i32(stream)? {
            0 => Ok(SecurityTokenRequestType::Issue),
            1 => Ok(SecurityTokenRequestType::Renew),
            r => Err(Error::decoding(format!(
                "Invalid security token request type {}",
                r
            ))),
        }
    }
}

/// The security token issued on a channel: the unit of symmetric key
/// validity.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSecurityToken {
    /// The id of the channel the token belongs to.
    pub channel_id: u32,
    /// The id of the token, strictly increasing within a channel.
    pub token_id: u32,
    /// Server-local creation time.
    pub created_at: DateTime,
    /// The lifetime granted to the client, in milliseconds.
    pub revised_lifetime: u32,
}

impl SimpleBinaryEncodable for ChannelSecurityToken {
    fn byte_len(&self) -> usize {
        4 + 4 + self.created_at.byte_len() + 4
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        write_u32(stream, self.channel_id)?;
        write_u32(stream, self.token_id)?;
        self.created_at.encode(stream)?;
        write_u32(stream, self.revised_lifetime)
    }
}

impl SimpleBinaryDecodable for ChannelSecurityToken {
    fn decode<S: Read + ?Sized>(
        stream: &mut S,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self> {
        Ok(ChannelSecurityToken {
            channel_id: read_u32(stream)?,
            token_id: read_u32(stream)?,
            created_at: DateTime::decode(stream, decoding_options)?,
            revised_lifetime: read_u32(stream)?,
        })
    }
}

macro_rules! service_struct {
    ($name:ident, $header:ident: $header_ty:ty, $($field:ident: $ty:ty),*) => {
        impl SimpleBinaryEncodable for $name {
            fn byte_len(&self) -> usize {
                let mut size = self.$header.byte_len();
                $( size += SimpleBinaryEncodable::byte_len(&self.$field); )*
                size
            }

            fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
                self.$header.encode(stream)?;
                $( self.$field.encode(stream)?; )*
                Ok(())
            }
        }

        impl SimpleBinaryDecodable for $name {
            fn decode<S: Read + ?Sized>(
                stream: &mut S,
                decoding_options: &DecodingOptions,
            ) -> EncodingResult<Self> {
                Ok($name {
                    $header: <$header_ty>::decode(stream, decoding_options)?,
                    $( $field: <$ty>::decode(stream, decoding_options)?, )*
                })
            }
        }
    };
}

/// Asks the server to open a secure channel or renew the token of an
/// existing one.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenSecureChannelRequest {
    /// Common request header.
    pub request_header: RequestHeader,
    /// The protocol version the client speaks.
    pub client_protocol_version: u32,
    /// Issue or renew.
    pub request_type: SecurityTokenRequestType,
    /// The security mode requested for the channel.
    pub security_mode: MessageSecurityMode,
    /// The client's half of the key derivation input. Its length must equal
    /// the symmetric key length of the channel's security policy.
    pub client_nonce: ByteString,
    /// The token lifetime the client asks for, in milliseconds. Zero means
    /// "use the server default".
    pub requested_lifetime: u32,
}

service_struct!(OpenSecureChannelRequest, request_header: RequestHeader,
    client_protocol_version: u32,
    request_type: SecurityTokenRequestType,
    security_mode: MessageSecurityMode,
    client_nonce: ByteString,
    requested_lifetime: u32);

/// The server's answer to an open secure channel request.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenSecureChannelResponse {
    /// Common response header, carrying the service result and the copied
    /// request handle.
    pub response_header: ResponseHeader,
    /// The protocol version the server speaks.
    pub server_protocol_version: u32,
    /// The token issued or renewed by this request.
    pub security_token: ChannelSecurityToken,
    /// The server's half of the key derivation input.
    pub server_nonce: ByteString,
}

service_struct!(OpenSecureChannelResponse, response_header: ResponseHeader,
    server_protocol_version: u32,
    security_token: ChannelSecurityToken,
    server_nonce: ByteString);

/// Asks the server to close the secure channel. There is no response; the
/// server closes the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseSecureChannelRequest {
    /// Common request header.
    pub request_header: RequestHeader,
}

service_struct!(CloseSecureChannelRequest, request_header: RequestHeader,);

/// Response to a close secure channel request. Defined by the standard but
/// never sent; a server closes the transport instead.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseSecureChannelResponse {
    /// Common response header.
    pub response_header: ResponseHeader,
}

service_struct!(CloseSecureChannelResponse, response_header: ResponseHeader,);

/// Cancels outstanding requests identified by their request handle.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelRequest {
    /// Common request header.
    pub request_header: RequestHeader,
    /// The handle of the request(s) to cancel.
    pub request_handle: u32,
}

service_struct!(CancelRequest, request_header: RequestHeader, request_handle: u32);

/// Response to a cancel request.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelResponse {
    /// Common response header.
    pub response_header: ResponseHeader,
    /// The number of requests cancelled.
    pub cancel_count: u32,
}

service_struct!(CancelResponse, response_header: ResponseHeader, cancel_count: u32);

/// The generic failure response. The service result in the response header
/// says what went wrong.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceFault {
    /// Common response header.
    pub response_header: ResponseHeader,
}

service_struct!(ServiceFault, response_header: ResponseHeader,);

impl ServiceFault {
    /// Create a service fault for the given request handle and result.
    pub fn new(request_handle: u32, service_result: crate::StatusCode) -> ServiceFault {
        ServiceFault {
            response_header: ResponseHeader::new_service_result(request_handle, service_result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_id::NodeId;
    use crate::status_code::StatusCode;
    use std::io::Cursor;

    fn round_trip<T: SimpleBinaryEncodable + SimpleBinaryDecodable + PartialEq + std::fmt::Debug>(
        value: &T,
    ) {
        let mut stream = Cursor::new(Vec::new());
        value.encode(&mut stream).unwrap();
        assert_eq!(stream.get_ref().len(), value.byte_len());
        let mut stream = Cursor::new(stream.into_inner());
        let decoded = T::decode(&mut stream, &DecodingOptions::test()).unwrap();
        // DateTime fields survive at tick resolution so equality holds
        assert_eq!(&decoded, value);
    }

    #[test]
    fn open_secure_channel_round_trip() {
        let request = OpenSecureChannelRequest {
            request_header: RequestHeader::new(NodeId::null(), 9),
            client_protocol_version: 0,
            request_type: SecurityTokenRequestType::Issue,
            security_mode: MessageSecurityMode::SignAndEncrypt,
            client_nonce: ByteString::from(vec![1u8; 32]),
            requested_lifetime: 60_000,
        };
        round_trip(&request);

        let response = OpenSecureChannelResponse {
            response_header: ResponseHeader::new_good(9u32),
            server_protocol_version: 0,
            security_token: ChannelSecurityToken {
                channel_id: 1,
                token_id: 1,
                created_at: DateTime::now(),
                revised_lifetime: 60_000,
            },
            server_nonce: ByteString::from(vec![2u8; 32]),
        };
        round_trip(&response);
    }

    #[test]
    fn service_fault_round_trip() {
        round_trip(&ServiceFault::new(4, StatusCode::BadSecurityPolicyRejected));
    }

    #[test]
    fn cancel_round_trip() {
        round_trip(&CancelRequest {
            request_header: RequestHeader::new(NodeId::null(), 10),
            request_handle: 5,
        });
        round_trip(&CancelResponse {
            response_header: ResponseHeader::new_good(10u32),
            cancel_count: 1,
        });
    }

    #[test]
    fn security_mode_wire_values() {
        for (mode, value) in [
            (MessageSecurityMode::Invalid, 0i32),
            (MessageSecurityMode::None, 1),
            (MessageSecurityMode::Sign, 2),
            (MessageSecurityMode::SignAndEncrypt, 3),
        ] {
            let mut stream = Cursor::new(Vec::new());
            mode.encode(&mut stream).unwrap();
            assert_eq!(stream.get_ref().as_slice(), &value.to_le_bytes());
        }
        assert_eq!(
            MessageSecurityMode::from("SignAndEncrypt"),
            MessageSecurityMode::SignAndEncrypt
        );
        assert_eq!(
            MessageSecurityMode::from("garbage"),
            MessageSecurityMode::Invalid
        );
    }
}
