// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Types for the opc.tcp connection handshake: hello, acknowledge and error
//! messages, plus the wire constants shared with chunk framing.

use std::io::{Read, Write};

use uasc_types::{
    process_decode_io_result, read_u32, read_u8, write_u32, write_u8, DecodingOptions,
    EncodingResult, Error, SimpleBinaryDecodable, SimpleBinaryEncodable, StatusCode, UAString,
};

/// Message type code for a hello message.
pub const HELLO_MESSAGE: &[u8] = b"HEL";
/// Message type code for an acknowledge message.
pub const ACKNOWLEDGE_MESSAGE: &[u8] = b"ACK";
/// Message type code for an error message.
pub const ERROR_MESSAGE: &[u8] = b"ERR";
/// Message type code for a regular message chunk.
pub const CHUNK_MESSAGE: &[u8] = b"MSG";
/// Message type code for an open secure channel chunk.
pub const OPEN_SECURE_CHANNEL_MESSAGE: &[u8] = b"OPN";
/// Message type code for a close secure channel chunk.
pub const CLOSE_SECURE_CHANNEL_MESSAGE: &[u8] = b"CLO";

/// Reserved / is-final byte for an intermediate chunk.
pub const CHUNK_INTERMEDIATE: u8 = b'C';
/// Reserved / is-final byte for a final chunk.
pub const CHUNK_FINAL: u8 = b'F';
/// Reserved / is-final byte for a final chunk that aborts the message.
pub const CHUNK_FINAL_ERROR: u8 = b'A';

/// Minimum size in bytes that a chunk (and hence each negotiated buffer)
/// must be able to hold.
pub const MIN_CHUNK_SIZE: usize = 8196;

/// Size of the header common to hello, acknowledge and error messages.
pub const MESSAGE_HEADER_SIZE: usize = 3 + 1 + 4;

/// The kind of a framed transport message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MessageType {
    /// Connection handshake from the client.
    Hello,
    /// Connection handshake answer from the server.
    Acknowledge,
    /// Fatal transport error report.
    Error,
    /// A secure channel chunk - MSG, OPN or CLO.
    Chunk,
}

/// The header common to hello, acknowledge and error messages.
#[derive(Debug, Clone, PartialEq)]
pub struct TcpMessageHeader {
    /// The kind of message that follows.
    pub message_type: MessageType,
    /// The size of the message including this header.
    pub message_size: u32,
}

impl TcpMessageHeader {
    /// Create a header; the size is filled in by the owning message.
    pub fn new(message_type: MessageType) -> TcpMessageHeader {
        TcpMessageHeader {
            message_type,
            message_size: 0,
        }
    }
}

impl SimpleBinaryEncodable for TcpMessageHeader {
    fn byte_len(&self) -> usize {
        MESSAGE_HEADER_SIZE
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        let message_type = match self.message_type {
            MessageType::Hello => HELLO_MESSAGE,
            MessageType::Acknowledge => ACKNOWLEDGE_MESSAGE,
            MessageType::Error => ERROR_MESSAGE,
            MessageType::Chunk => {
                return Err(Error::encoding(
                    "Chunks carry their own header, not a TcpMessageHeader",
                ));
            }
        };
        uasc_types::process_encode_io_result(stream.write_all(message_type))?;
        write_u8(stream, CHUNK_FINAL)?;
        write_u32(stream, self.message_size)
    }
}

impl SimpleBinaryDecodable for TcpMessageHeader {
    fn decode<S: Read + ?Sized>(stream: &mut S, _: &DecodingOptions) -> EncodingResult<Self> {
        let mut message_type_code = [0u8; 3];
        process_decode_io_result(stream.read_exact(&mut message_type_code))?;
        let message_type = match &message_type_code as &[u8] {
            HELLO_MESSAGE => MessageType::Hello,
            ACKNOWLEDGE_MESSAGE => MessageType::Acknowledge,
            ERROR_MESSAGE => MessageType::Error,
            CHUNK_MESSAGE | OPEN_SECURE_CHANNEL_MESSAGE | CLOSE_SECURE_CHANNEL_MESSAGE => {
                MessageType::Chunk
            }
            r => {
                return Err(Error::new(
                    StatusCode::BadTcpMessageTypeInvalid,
                    format!("Invalid message type code {:?}", r),
                ));
            }
        };
        let _reserved = read_u8(stream)?;
        let message_size = read_u32(stream)?;
        Ok(TcpMessageHeader {
            message_type,
            message_size,
        })
    }
}

/// Hello message sent by the client as the first thing on a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct HelloMessage {
    /// Common message header.
    pub message_header: TcpMessageHeader,
    /// The version of the opc.tcp protocol the client speaks.
    pub protocol_version: u32,
    /// The largest chunk the client can receive.
    pub receive_buffer_size: u32,
    /// The largest chunk the client will send.
    pub send_buffer_size: u32,
    /// The largest whole message the client accepts, 0 for no limit.
    pub max_message_size: u32,
    /// The most chunks per message the client accepts, 0 for no limit.
    pub max_chunk_count: u32,
    /// The url of the endpoint the client wants to talk to.
    pub endpoint_url: UAString,
}

impl HelloMessage {
    const MAX_URL_LEN: usize = 4096;

    /// Create a hello message for the given endpoint and limits.
    pub fn new(
        endpoint_url: &str,
        send_buffer_size: usize,
        receive_buffer_size: usize,
        max_message_size: usize,
        max_chunk_count: usize,
    ) -> HelloMessage {
        let mut msg = HelloMessage {
            message_header: TcpMessageHeader::new(MessageType::Hello),
            protocol_version: 0,
            receive_buffer_size: receive_buffer_size as u32,
            send_buffer_size: send_buffer_size as u32,
            max_message_size: max_message_size as u32,
            max_chunk_count: max_chunk_count as u32,
            endpoint_url: UAString::from(endpoint_url),
        };
        msg.message_header.message_size = msg.byte_len() as u32;
        msg
    }

    /// `true` if the advertised buffer sizes meet the minimum chunk size.
    pub fn is_valid_buffer_sizes(&self) -> bool {
        self.receive_buffer_size as usize >= MIN_CHUNK_SIZE
            && self.send_buffer_size as usize >= MIN_CHUNK_SIZE
    }

    /// `true` if the endpoint url is present and within sane length limits.
    pub fn is_endpoint_url_valid(&self) -> bool {
        !self.endpoint_url.is_empty() && self.endpoint_url.as_ref().len() <= Self::MAX_URL_LEN
    }
}

impl SimpleBinaryEncodable for HelloMessage {
    fn byte_len(&self) -> usize {
        MESSAGE_HEADER_SIZE + 20 + self.endpoint_url.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.message_header.encode(stream)?;
        write_u32(stream, self.protocol_version)?;
        write_u32(stream, self.receive_buffer_size)?;
        write_u32(stream, self.send_buffer_size)?;
        write_u32(stream, self.max_message_size)?;
        write_u32(stream, self.max_chunk_count)?;
        self.endpoint_url.encode(stream)
    }
}

impl SimpleBinaryDecodable for HelloMessage {
    fn decode<S: Read + ?Sized>(
        stream: &mut S,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self> {
        Ok(HelloMessage {
            message_header: TcpMessageHeader::decode(stream, decoding_options)?,
            protocol_version: read_u32(stream)?,
            receive_buffer_size: read_u32(stream)?,
            send_buffer_size: read_u32(stream)?,
            max_message_size: read_u32(stream)?,
            max_chunk_count: read_u32(stream)?,
            endpoint_url: UAString::decode(stream, decoding_options)?,
        })
    }
}

/// Acknowledge message sent by the server in response to a hello, carrying
/// the limits the server revised.
#[derive(Debug, Clone, PartialEq)]
pub struct AcknowledgeMessage {
    /// Common message header.
    pub message_header: TcpMessageHeader,
    /// The version of the opc.tcp protocol the server speaks.
    pub protocol_version: u32,
    /// The largest chunk the server can receive.
    pub receive_buffer_size: u32,
    /// The largest chunk the server will send.
    pub send_buffer_size: u32,
    /// The largest whole message the server accepts, 0 for no limit.
    pub max_message_size: u32,
    /// The most chunks per message the server accepts, 0 for no limit.
    pub max_chunk_count: u32,
}

impl AcknowledgeMessage {
    /// Create an acknowledge message with the revised limits.
    pub fn new(
        protocol_version: u32,
        receive_buffer_size: u32,
        send_buffer_size: u32,
        max_message_size: u32,
        max_chunk_count: u32,
    ) -> AcknowledgeMessage {
        let mut msg = AcknowledgeMessage {
            message_header: TcpMessageHeader::new(MessageType::Acknowledge),
            protocol_version,
            receive_buffer_size,
            send_buffer_size,
            max_message_size,
            max_chunk_count,
        };
        msg.message_header.message_size = msg.byte_len() as u32;
        msg
    }
}

impl SimpleBinaryEncodable for AcknowledgeMessage {
    fn byte_len(&self) -> usize {
        MESSAGE_HEADER_SIZE + 20
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.message_header.encode(stream)?;
        write_u32(stream, self.protocol_version)?;
        write_u32(stream, self.receive_buffer_size)?;
        write_u32(stream, self.send_buffer_size)?;
        write_u32(stream, self.max_message_size)?;
        write_u32(stream, self.max_chunk_count)
    }
}

impl SimpleBinaryDecodable for AcknowledgeMessage {
    fn decode<S: Read + ?Sized>(
        stream: &mut S,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self> {
        Ok(AcknowledgeMessage {
            message_header: TcpMessageHeader::decode(stream, decoding_options)?,
            protocol_version: read_u32(stream)?,
            receive_buffer_size: read_u32(stream)?,
            send_buffer_size: read_u32(stream)?,
            max_message_size: read_u32(stream)?,
            max_chunk_count: read_u32(stream)?,
        })
    }
}

/// Error message sent to report a fatal transport-level failure before
/// dropping the connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMessage {
    /// Common message header.
    pub message_header: TcpMessageHeader,
    /// The numeric status code of the failure.
    pub error: u32,
    /// Human readable reason.
    pub reason: UAString,
}

impl ErrorMessage {
    /// Create an error message from a status code and reason.
    pub fn new(status_code: StatusCode, reason: &str) -> ErrorMessage {
        let mut msg = ErrorMessage {
            message_header: TcpMessageHeader::new(MessageType::Error),
            error: status_code.bits(),
            reason: UAString::from(reason),
        };
        msg.message_header.message_size = msg.byte_len() as u32;
        msg
    }

    /// The status code of the failure.
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_bits(self.error)
    }
}

impl SimpleBinaryEncodable for ErrorMessage {
    fn byte_len(&self) -> usize {
        MESSAGE_HEADER_SIZE + 4 + self.reason.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.message_header.encode(stream)?;
        write_u32(stream, self.error)?;
        self.reason.encode(stream)
    }
}

impl SimpleBinaryDecodable for ErrorMessage {
    fn decode<S: Read + ?Sized>(
        stream: &mut S,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self> {
        Ok(ErrorMessage {
            message_header: TcpMessageHeader::decode(stream, decoding_options)?,
            error: read_u32(stream)?,
            reason: UAString::decode(stream, decoding_options)?,
        })
    }
}
