// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! A tokio codec that turns the byte stream of an opc.tcp connection into
//! framed transport messages.

use std::io::Cursor;

use bytes::BytesMut;
use log::error;
use tokio_util::codec::Decoder;

use uasc_types::{DecodingOptions, SimpleBinaryDecodable};

use super::message_chunk::MessageChunk;
use super::tcp_types::{
    AcknowledgeMessage, ErrorMessage, HelloMessage, ACKNOWLEDGE_MESSAGE, CHUNK_MESSAGE,
    CLOSE_SECURE_CHANNEL_MESSAGE, ERROR_MESSAGE, HELLO_MESSAGE, MESSAGE_HEADER_SIZE,
    OPEN_SECURE_CHANNEL_MESSAGE,
};

/// A framed message received from the transport.
#[derive(Debug)]
pub enum Message {
    /// Connection handshake from the client.
    Hello(HelloMessage),
    /// Connection handshake answer from the server.
    Acknowledge(AcknowledgeMessage),
    /// Fatal transport error report.
    Error(ErrorMessage),
    /// A secure channel chunk, still secured.
    Chunk(MessageChunk),
}

/// Decoder for the opc.tcp framing. Every message starts with a 3 byte type
/// code, a reserved / is-final byte and a 4 byte little endian total size,
/// so frames can be split off without interpreting their content.
pub struct TcpCodec {
    decoding_options: DecodingOptions,
}

impl TcpCodec {
    /// Create a codec enforcing the given decoding limits.
    pub fn new(decoding_options: DecodingOptions) -> TcpCodec {
        TcpCodec { decoding_options }
    }
}

impl Decoder for TcpCodec {
    type Item = Message;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        if src.len() < MESSAGE_HEADER_SIZE {
            return Ok(None);
        }

        let message_size =
            u32::from_le_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if message_size < MESSAGE_HEADER_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Message size {} is impossibly small", message_size),
            ));
        }
        if self.decoding_options.max_message_size > 0
            && message_size > self.decoding_options.max_message_size
        {
            error!(
                "Message size {} exceeds configured maximum {}",
                message_size, self.decoding_options.max_message_size
            );
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Message exceeds maximum message size",
            ));
        }
        if src.len() < message_size {
            // Tell the buffer how much more we expect
            src.reserve(message_size - src.len());
            return Ok(None);
        }

        let data = src.split_to(message_size);
        let message = match &data[0..3] {
            HELLO_MESSAGE => {
                let mut stream = Cursor::new(&data[..]);
                Message::Hello(
                    HelloMessage::decode(&mut stream, &self.decoding_options)
                        .map_err(std::io::Error::from)?,
                )
            }
            ACKNOWLEDGE_MESSAGE => {
                let mut stream = Cursor::new(&data[..]);
                Message::Acknowledge(
                    AcknowledgeMessage::decode(&mut stream, &self.decoding_options)
                        .map_err(std::io::Error::from)?,
                )
            }
            ERROR_MESSAGE => {
                let mut stream = Cursor::new(&data[..]);
                Message::Error(
                    ErrorMessage::decode(&mut stream, &self.decoding_options)
                        .map_err(std::io::Error::from)?,
                )
            }
            CHUNK_MESSAGE | OPEN_SECURE_CHANNEL_MESSAGE | CLOSE_SECURE_CHANNEL_MESSAGE => {
                Message::Chunk(MessageChunk {
                    data: data.to_vec(),
                })
            }
            r => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Unrecognized message type code {:?}", r),
                ));
            }
        };
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uasc_types::{SimpleBinaryEncodable, StatusCode};

    fn decode_all(codec: &mut TcpCodec, bytes: &[u8]) -> Vec<Message> {
        let mut buffer = BytesMut::from(bytes);
        let mut messages = Vec::new();
        while let Some(message) = codec.decode(&mut buffer).unwrap() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn decodes_hello_and_error_frames() {
        let mut bytes = HelloMessage::new("opc.tcp://localhost/", 65536, 65536, 0, 0)
            .encode_to_vec();
        bytes.extend(ErrorMessage::new(StatusCode::BadTimeout, "slow").encode_to_vec());

        let mut codec = TcpCodec::new(DecodingOptions::test());
        let messages = decode_all(&mut codec, &bytes);
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], Message::Hello(_)));
        assert!(matches!(messages[1], Message::Error(_)));
    }

    #[test]
    fn waits_for_full_frame() {
        let bytes = HelloMessage::new("opc.tcp://localhost/", 65536, 65536, 0, 0)
            .encode_to_vec();
        let mut codec = TcpCodec::new(DecodingOptions::test());
        let mut buffer = BytesMut::from(&bytes[..bytes.len() - 1]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(&bytes[bytes.len() - 1..]);
        assert!(codec.decode(&mut buffer).unwrap().is_some());
    }

    #[test]
    fn rejects_garbage_type_code() {
        let mut bytes = b"XYZF".to_vec();
        bytes.extend(12u32.to_le_bytes());
        bytes.extend([0u8; 4]);
        let mut codec = TcpCodec::new(DecodingOptions::test());
        let mut buffer = BytesMut::from(&bytes[..]);
        assert!(codec.decode(&mut buffer).is_err());
    }

    #[test]
    fn rejects_oversized_message() {
        let mut bytes = b"MSGF".to_vec();
        bytes.extend(100_000u32.to_le_bytes());
        let options = DecodingOptions {
            max_message_size: 1024,
            ..Default::default()
        };
        let mut codec = TcpCodec::new(options);
        let mut buffer = BytesMut::from(&bytes[..]);
        assert!(codec.decode(&mut buffer).is_err());
    }
}
