// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! A message chunk is a message or a portion of a message, optionally
//! signed and encrypted, which has been split for transmission.

use std::io::{Cursor, Read, Write};
use std::ops::Range;

use uasc_types::{
    process_decode_io_result, read_u32, read_u8, write_u32, write_u8, DecodingOptions,
    EncodingResult, Error, SimpleBinaryDecodable, SimpleBinaryEncodable,
};

use super::channel_security::ChannelSecurity;
use super::security_header::{SecurityHeader, SequenceHeader};
use super::tcp_types::{
    CHUNK_FINAL, CHUNK_FINAL_ERROR, CHUNK_INTERMEDIATE, CHUNK_MESSAGE,
    CLOSE_SECURE_CHANNEL_MESSAGE, OPEN_SECURE_CHANNEL_MESSAGE,
};

/// The size of a chunk header, used by several places
pub const MESSAGE_CHUNK_HEADER_SIZE: usize = 3 + 1 + 4 + 4;
/// Offset of the MessageSize in chunk headers. This comes after the chunk
/// type and the is_final flag.
pub const MESSAGE_SIZE_OFFSET: usize = 3 + 1;

/// Type of message chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MessageChunkType {
    /// Chunk is part of a normal service message.
    Message,
    /// Chunk is an open secure channel message.
    OpenSecureChannel,
    /// Chunk is a close secure channel message.
    CloseSecureChannel,
}

impl MessageChunkType {
    /// `true` if this is an `OpenSecureChannel` message.
    pub fn is_open_secure_channel(&self) -> bool {
        *self == MessageChunkType::OpenSecureChannel
    }

    fn wire_code(&self) -> &'static [u8] {
        match self {
            MessageChunkType::Message => CHUNK_MESSAGE,
            MessageChunkType::OpenSecureChannel => OPEN_SECURE_CHANNEL_MESSAGE,
            MessageChunkType::CloseSecureChannel => CLOSE_SECURE_CHANNEL_MESSAGE,
        }
    }

    fn from_wire_code(code: &[u8]) -> Option<MessageChunkType> {
        match code {
            CHUNK_MESSAGE => Some(MessageChunkType::Message),
            OPEN_SECURE_CHANNEL_MESSAGE => Some(MessageChunkType::OpenSecureChannel),
            CLOSE_SECURE_CHANNEL_MESSAGE => Some(MessageChunkType::CloseSecureChannel),
            _ => None,
        }
    }
}

/// Whether a chunk terminates its message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MessageIsFinalType {
    /// Intermediate chunk.
    Intermediate,
    /// Final chunk.
    Final,
    /// Final chunk, aborting the message.
    FinalError,
}

impl MessageIsFinalType {
    fn as_byte(&self) -> u8 {
        match self {
            MessageIsFinalType::Intermediate => CHUNK_INTERMEDIATE,
            MessageIsFinalType::Final => CHUNK_FINAL,
            MessageIsFinalType::FinalError => CHUNK_FINAL_ERROR,
        }
    }

    fn from_byte(byte: u8) -> Option<MessageIsFinalType> {
        match byte {
            CHUNK_INTERMEDIATE => Some(MessageIsFinalType::Intermediate),
            CHUNK_FINAL => Some(MessageIsFinalType::Final),
            CHUNK_FINAL_ERROR => Some(MessageIsFinalType::FinalError),
            _ => None,
        }
    }
}

/// Message chunk header.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageChunkHeader {
    /// The kind of chunk - message, open or close.
    pub message_type: MessageChunkType,
    /// The chunk type - C == intermediate, F = the final chunk, A = the
    /// final chunk when aborting.
    pub is_final: MessageIsFinalType,
    /// The size of the chunk (message) including the header.
    pub message_size: u32,
    /// Secure channel id.
    pub secure_channel_id: u32,
}

impl SimpleBinaryEncodable for MessageChunkHeader {
    fn byte_len(&self) -> usize {
        MESSAGE_CHUNK_HEADER_SIZE
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        uasc_types::process_encode_io_result(stream.write_all(self.message_type.wire_code()))?;
        write_u8(stream, self.is_final.as_byte())?;
        write_u32(stream, self.message_size)?;
        write_u32(stream, self.secure_channel_id)
    }
}

impl SimpleBinaryDecodable for MessageChunkHeader {
    fn decode<S: Read + ?Sized>(stream: &mut S, _: &DecodingOptions) -> EncodingResult<Self> {
        let mut code = [0u8; 3];
        process_decode_io_result(stream.read_exact(&mut code))?;
        let message_type = MessageChunkType::from_wire_code(&code)
            .ok_or_else(|| Error::decoding(format!("Invalid message chunk type: {code:?}")))?;
        let is_final_byte = read_u8(stream)?;
        let is_final = MessageIsFinalType::from_byte(is_final_byte)
            .ok_or_else(|| Error::decoding(format!("Invalid message final type: {is_final_byte}")))?;
        Ok(MessageChunkHeader {
            message_type,
            is_final,
            message_size: read_u32(stream)?,
            secure_channel_id: read_u32(stream)?,
        })
    }
}

/// The decoded headers of a chunk plus where its body sits in the data.
/// Only meaningful on a chunk whose security has been removed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkHeaders {
    /// The chunk header.
    pub chunk_header: MessageChunkHeader,
    /// The asymmetric or symmetric security header.
    pub security_header: SecurityHeader,
    /// The sequence header.
    pub sequence_header: SequenceHeader,
    /// Where the body sits within the chunk data.
    pub body: Range<usize>,
}

/// A chunk holds a message or a portion of one. On the inbound side its
/// data may still be signed and encrypted; on the outbound side chunks are
/// built as plaintext and secured when they are written out.
#[derive(Debug)]
pub struct MessageChunk {
    /// All of the chunk's data including headers, payload, padding, signature.
    pub data: Vec<u8>,
}

impl MessageChunk {
    /// Build a plaintext chunk around the supplied body.
    pub fn new(
        sequence_number: u32,
        request_id: u32,
        message_type: MessageChunkType,
        is_final: MessageIsFinalType,
        security: &ChannelSecurity,
        body: &[u8],
    ) -> EncodingResult<MessageChunk> {
        let security_header = security.security_header_for(message_type);
        let sequence_header = SequenceHeader {
            sequence_number,
            request_id,
        };
        let message_size = MESSAGE_CHUNK_HEADER_SIZE
            + security_header.byte_len()
            + sequence_header.byte_len()
            + body.len();
        let chunk_header = MessageChunkHeader {
            message_type,
            is_final,
            message_size: message_size as u32,
            secure_channel_id: security.secure_channel_id(),
        };

        let mut data = Vec::with_capacity(message_size);
        chunk_header.encode(&mut data)?;
        security_header.encode(&mut data)?;
        sequence_header.encode(&mut data)?;
        data.extend_from_slice(body);
        Ok(MessageChunk { data })
    }

    /// Decode just the chunk header.
    pub fn message_header(
        &self,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<MessageChunkHeader> {
        let mut stream = Cursor::new(&self.data);
        MessageChunkHeader::decode(&mut stream, decoding_options)
    }

    /// `true` if this chunk is part of an open secure channel message.
    pub fn is_open_secure_channel(&self, decoding_options: &DecodingOptions) -> bool {
        self.message_header(decoding_options)
            .map(|header| header.message_type.is_open_secure_channel())
            .unwrap_or(false)
    }

    /// Decode all the headers and locate the body.
    pub fn headers(&self, decoding_options: &DecodingOptions) -> EncodingResult<ChunkHeaders> {
        let mut stream = Cursor::new(&self.data);
        let chunk_header = MessageChunkHeader::decode(&mut stream, decoding_options)?;
        let security_header =
            SecurityHeader::decode(&mut stream, chunk_header.message_type, decoding_options)?;
        let sequence_header = SequenceHeader::decode(&mut stream, decoding_options)?;
        let body = (stream.position() as usize)..self.data.len();
        Ok(ChunkHeaders {
            chunk_header,
            security_header,
            sequence_header,
            body,
        })
    }

    /// The length of the clear prefix of a secured chunk: the chunk header
    /// plus the security header. Everything after is covered by encryption.
    pub(crate) fn secured_data_offset(
        &self,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<usize> {
        let mut stream = Cursor::new(&self.data);
        let chunk_header = MessageChunkHeader::decode(&mut stream, decoding_options)?;
        SecurityHeader::decode(&mut stream, chunk_header.message_type, decoding_options)?;
        Ok(stream.position() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_header_round_trip() {
        let header = MessageChunkHeader {
            message_type: MessageChunkType::OpenSecureChannel,
            is_final: MessageIsFinalType::Final,
            message_size: 1234,
            secure_channel_id: 77,
        };
        let mut stream = Cursor::new(header.encode_to_vec());
        assert_eq!(stream.get_ref().len(), MESSAGE_CHUNK_HEADER_SIZE);
        let decoded = MessageChunkHeader::decode(&mut stream, &DecodingOptions::test()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn garbage_type_codes_are_rejected() {
        let mut bytes = b"XYZ".to_vec();
        bytes.push(CHUNK_FINAL);
        bytes.extend_from_slice(&[0u8; 8]);
        let mut stream = Cursor::new(bytes);
        assert!(MessageChunkHeader::decode(&mut stream, &DecodingOptions::test()).is_err());

        let mut bytes = CHUNK_MESSAGE.to_vec();
        bytes.push(b'Z');
        bytes.extend_from_slice(&[0u8; 8]);
        let mut stream = Cursor::new(bytes);
        assert!(MessageChunkHeader::decode(&mut stream, &DecodingOptions::test()).is_err());
    }

    #[test]
    fn new_chunk_has_consistent_headers() {
        let security = ChannelSecurity::new(DecodingOptions::test());
        let body = vec![0xCDu8; 100];
        let chunk = MessageChunk::new(
            9,
            3,
            MessageChunkType::Message,
            MessageIsFinalType::Final,
            &security,
            &body,
        )
        .unwrap();

        let headers = chunk.headers(&DecodingOptions::test()).unwrap();
        assert_eq!(headers.chunk_header.message_size as usize, chunk.data.len());
        assert_eq!(headers.chunk_header.message_type, MessageChunkType::Message);
        assert_eq!(headers.sequence_header.sequence_number, 9);
        assert_eq!(headers.sequence_header.request_id, 3);
        assert_eq!(&chunk.data[headers.body], &body[..]);
    }
}
