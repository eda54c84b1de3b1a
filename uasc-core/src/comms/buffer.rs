// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! [SendBuffer], the outbound half of a transport: messages are chunked
//! into it, secured one chunk at a time, and drained to the stream.

use std::collections::VecDeque;

use bytes::BytesMut;
use log::trace;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use uasc_types::{EncodingResult, Error, StatusCode};

use crate::Message;

use super::channel_security::ChannelSecurity;
use super::chunker::Chunker;
use super::message_chunk::{MessageChunk, MessageChunkType};

/// Buffer of outgoing data. Writing a message turns it into plain chunks;
/// the chunks have security applied lazily, one whenever the byte buffer has
/// been fully drained, so that a chunk is always secured with the channel's
/// current keys.
pub struct SendBuffer {
    /// Bytes ready to be written to the stream, already secured.
    buffer: BytesMut,
    /// Chunks waiting to be secured.
    chunks: VecDeque<MessageChunk>,
    /// The negotiated maximum size of a single chunk.
    pub send_buffer_size: usize,
    /// The negotiated maximum size of a whole message, 0 for no limit.
    pub max_message_size: usize,
    /// The negotiated maximum number of chunks per message, 0 for no limit.
    pub max_chunk_count: usize,
    /// The sequence number of the last chunk written to this buffer.
    last_sequence_number: u32,
}

impl SendBuffer {
    /// Create a send buffer with the given limits.
    pub fn new(send_buffer_size: usize, max_message_size: usize, max_chunk_count: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(send_buffer_size),
            chunks: VecDeque::new(),
            send_buffer_size,
            max_message_size,
            max_chunk_count,
            last_sequence_number: 0,
        }
    }

    /// Revise the limits after negotiation. Limits only ever shrink.
    pub fn revise(
        &mut self,
        send_buffer_size: usize,
        max_message_size: usize,
        max_chunk_count: usize,
    ) {
        if send_buffer_size > 0 && send_buffer_size < self.send_buffer_size {
            self.send_buffer_size = send_buffer_size;
        }
        if max_message_size > 0 && (self.max_message_size == 0 || max_message_size < self.max_message_size)
        {
            self.max_message_size = max_message_size;
        }
        if max_chunk_count > 0 && (self.max_chunk_count == 0 || max_chunk_count < self.max_chunk_count)
        {
            self.max_chunk_count = max_chunk_count;
        }
    }

    /// Chunk a message into the buffer. The chunks are not secured yet.
    /// `message_type` is normally the message's own chunk type; handshake
    /// faults override it to travel as OPN chunks.
    pub fn write(
        &mut self,
        request_id: u32,
        message: &impl Message,
        message_type: MessageChunkType,
        security: &ChannelSecurity,
    ) -> EncodingResult<()> {
        trace!("Writing request {} to send buffer", request_id);
        let chunks = Chunker::encode_with_type(
            self.last_sequence_number + 1,
            request_id,
            self.max_message_size,
            self.send_buffer_size,
            message_type,
            security,
            message,
        )?;

        if self.max_chunk_count > 0 && chunks.len() > self.max_chunk_count {
            let handle = message.request_handle();
            return Err(Error::new(
                StatusCode::BadResponseTooLarge,
                format!(
                    "Message encoded to {} chunks, exceeding the negotiated limit of {}",
                    chunks.len(),
                    self.max_chunk_count
                ),
            )
            .with_context(
                Some(request_id),
                if handle > 0 { Some(handle) } else { None },
            ));
        }

        self.last_sequence_number += chunks.len() as u32;
        self.chunks.extend(chunks);
        Ok(())
    }

    /// `true` when a pending chunk should be secured into the byte buffer.
    pub fn should_encode_chunks(&self) -> bool {
        !self.chunks.is_empty() && !self.can_read()
    }

    /// Apply security to the next pending chunk and append the result to the
    /// byte buffer.
    pub fn encode_next_chunk(&mut self, security: &ChannelSecurity) -> EncodingResult<()> {
        let Some(chunk) = self.chunks.pop_front() else {
            return Ok(());
        };
        // Padding, signature and RSA block expansion all grow the chunk, the
        // chunker left room for them within the negotiated chunk size. Double
        // plus a block is a safe upper bound either way.
        let mut dst = vec![0u8; chunk.data.len() * 2 + 1024];
        let size = security.secure_outgoing_chunk(&chunk, &mut dst)?;
        self.buffer.extend_from_slice(&dst[..size]);
        Ok(())
    }

    /// `true` when there are bytes ready to write to the stream.
    pub fn can_read(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// `true` when everything written has been secured and drained.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty() && self.buffer.is_empty()
    }

    /// Drain the byte buffer into the stream. Returns the number of bytes
    /// written.
    pub async fn read_into_async<W: AsyncWrite + Unpin>(
        &mut self,
        write: &mut W,
    ) -> std::io::Result<usize> {
        let len = self.buffer.len();
        write.write_all_buf(&mut self.buffer).await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{MessageType, ResponseMessage};
    use uasc_types::{DecodingOptions, MessageSecurityMode, ServiceFault};

    fn unsecured() -> ChannelSecurity {
        let mut security = ChannelSecurity::new(DecodingOptions::test());
        security.set_security_policy(uasc_crypto::SecurityPolicy::None);
        security.set_security_mode(MessageSecurityMode::None);
        security
    }

    #[tokio::test]
    async fn write_encode_drain() {
        let security = unsecured();
        let mut buffer = SendBuffer::new(65536, 0, 0);
        let response =
            ResponseMessage::from(ServiceFault::new(1, uasc_types::StatusCode::Good));

        assert!(buffer.is_empty());
        buffer.write(1, &response, response.message_type(), &security).unwrap();
        assert!(buffer.should_encode_chunks());
        assert!(!buffer.can_read());

        buffer.encode_next_chunk(&security).unwrap();
        assert!(buffer.can_read());
        assert!(!buffer.should_encode_chunks());

        let mut out = Vec::new();
        let written = buffer.read_into_async(&mut out).await.unwrap();
        assert_eq!(written, out.len());
        assert!(buffer.is_empty());
        // Chunk starts with the MSG type code
        assert_eq!(&out[0..3], b"MSG");
    }

    #[test]
    fn sequence_numbers_continue_across_messages() {
        let security = unsecured();
        let mut buffer = SendBuffer::new(65536, 0, 0);
        let response =
            ResponseMessage::from(ServiceFault::new(1, uasc_types::StatusCode::Good));

        buffer.write(1, &response, response.message_type(), &security).unwrap();
        buffer.write(2, &response, response.message_type(), &security).unwrap();
        assert_eq!(buffer.chunks.len(), 2);

        let first = buffer.chunks[0].headers(&security.decoding_options()).unwrap();
        let second = buffer.chunks[1].headers(&security.decoding_options()).unwrap();
        assert_eq!(
            second.sequence_header.sequence_number,
            first.sequence_header.sequence_number + 1
        );
    }

    #[test]
    fn revise_only_shrinks() {
        let mut buffer = SendBuffer::new(65536, 0, 0);
        buffer.revise(8196, 1024, 4);
        assert_eq!(buffer.send_buffer_size, 8196);
        assert_eq!(buffer.max_message_size, 1024);
        assert_eq!(buffer.max_chunk_count, 4);
        // Growing is ignored
        buffer.revise(65536, 2048, 8);
        assert_eq!(buffer.send_buffer_size, 8196);
        assert_eq!(buffer.max_message_size, 1024);
        assert_eq!(buffer.max_chunk_count, 4);
    }
}
