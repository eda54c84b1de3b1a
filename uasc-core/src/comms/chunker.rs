// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Contains code for turning messages into chunks and chunks into messages.

use std::io::Cursor;

use log::error;

use uasc_types::{
    Error, NodeId, SimpleBinaryDecodable, SimpleBinaryEncodable, StatusCode,
};

use crate::Message;

use super::channel_security::ChannelSecurity;
use super::message_chunk::{MessageChunk, MessageChunkType, MessageIsFinalType};

/// The Chunker is responsible for turning messages into chunks and chunks
/// into messages.
pub struct Chunker;

impl Chunker {
    /// Ensure all of the supplied chunks belong to this channel, share one
    /// request id, and carry contiguous sequence numbers no older than
    /// `starting_sequence_number`. Returns the last sequence number in the
    /// series.
    pub fn validate_chunks(
        starting_sequence_number: u32,
        security: &ChannelSecurity,
        chunks: &[MessageChunk],
    ) -> Result<u32, Error> {
        let decoding_options = security.decoding_options();
        let channel_id = security.secure_channel_id();

        let mut request_id = None;
        let mut last_sequence_number = None;
        for chunk in chunks {
            let headers = chunk.headers(&decoding_options)?;

            if channel_id != 0 && headers.chunk_header.secure_channel_id != channel_id {
                return Err(Error::new(
                    StatusCode::BadSecureChannelIdInvalid,
                    format!(
                        "Chunk carries secure channel id {} instead of {}",
                        headers.chunk_header.secure_channel_id, channel_id
                    ),
                ));
            }

            let sequence_number = headers.sequence_header.sequence_number;
            let expected = match last_sequence_number {
                // The first chunk may be ahead of the expected number but
                // never behind it
                None if sequence_number < starting_sequence_number => {
                    return Err(Error::new(
                        StatusCode::BadSequenceNumberInvalid,
                        format!(
                            "Sequence number {} is older than the expected {}",
                            sequence_number, starting_sequence_number
                        ),
                    ));
                }
                None => sequence_number,
                Some(last) => last + 1,
            };
            if sequence_number != expected {
                return Err(Error::new(
                    StatusCode::BadSequenceNumberInvalid,
                    format!(
                        "Sequence number {} does not follow from {:?}",
                        sequence_number, last_sequence_number
                    ),
                ));
            }
            last_sequence_number = Some(sequence_number);

            match request_id {
                None => request_id = Some(headers.sequence_header.request_id),
                Some(id) if id != headers.sequence_header.request_id => {
                    return Err(Error::new(
                        StatusCode::BadSequenceNumberInvalid,
                        format!(
                            "Chunk carries request id {} in a message with request id {}",
                            headers.sequence_header.request_id, id
                        ),
                    ));
                }
                Some(_) => {}
            }
        }
        last_sequence_number.ok_or_else(|| {
            Error::new(StatusCode::BadUnexpectedError, "No chunks to validate")
        })
    }

    /// Encode a message into chunks of at most `max_chunk_size` bytes,
    /// numbered from `sequence_number`. `max_message_size` bounds the
    /// message itself; either limit may be 0 for no limit.
    pub fn encode(
        sequence_number: u32,
        request_id: u32,
        max_message_size: usize,
        max_chunk_size: usize,
        security: &ChannelSecurity,
        message: &impl Message,
    ) -> Result<Vec<MessageChunk>, Error> {
        Self::encode_with_type(
            sequence_number,
            request_id,
            max_message_size,
            max_chunk_size,
            message.message_type(),
            security,
            message,
        )
    }

    /// Like [`Chunker::encode`], but with an explicit chunk type instead of
    /// the message's own. A handshake rejection is a service fault that must
    /// still travel as an OPN chunk so the receiver can remove its security
    /// without derived keys.
    pub fn encode_with_type(
        sequence_number: u32,
        request_id: u32,
        max_message_size: usize,
        max_chunk_size: usize,
        message_type: MessageChunkType,
        security: &ChannelSecurity,
        message: &impl Message,
    ) -> Result<Vec<MessageChunk>, Error> {
        let handle = message.request_handle();
        let context_handle = if handle > 0 { Some(handle) } else { None };
        let with_context = |e: Error| e.with_context(Some(request_id), context_handle);

        // The payload is the type id followed by the message body
        let type_id = message.type_id();
        let payload_size = type_id.byte_len() + message.byte_len();
        if max_message_size > 0 && payload_size > max_message_size {
            error!(
                "Message of {} bytes exceeds the limit of {}",
                payload_size, max_message_size
            );
            // This stack only sends responses
            return Err(with_context(Error::new(
                StatusCode::BadResponseTooLarge,
                format!(
                    "Message of {} bytes exceeds the limit of {}",
                    payload_size, max_message_size
                ),
            )));
        }

        let mut payload = Vec::with_capacity(payload_size);
        type_id.encode(&mut payload)?;
        message.encode(&mut payload).map_err(with_context)?;
        debug_assert_eq!(payload.len(), payload_size);

        let max_body = if max_chunk_size > 0 {
            security
                .max_chunk_body_size(message_type, max_chunk_size)
                .map_err(with_context)?
        } else {
            payload.len()
        };

        let piece_count = payload.len().div_ceil(max_body);
        let mut chunks = Vec::with_capacity(piece_count);
        for (i, piece) in payload.chunks(max_body).enumerate() {
            let is_final = if i + 1 == piece_count {
                MessageIsFinalType::Final
            } else {
                MessageIsFinalType::Intermediate
            };
            chunks.push(MessageChunk::new(
                sequence_number + i as u32,
                request_id,
                message_type,
                is_final,
                security,
                piece,
            )?);
        }
        Ok(chunks)
    }

    /// Decode a message from its sequence of chunks. The chunks must have
    /// had their security removed already.
    pub fn decode<T: Message>(
        chunks: &[MessageChunk],
        security: &ChannelSecurity,
        expected_node_id: Option<NodeId>,
    ) -> Result<T, Error> {
        let decoding_options = security.decoding_options();

        let mut payload = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let headers = chunk.headers(&decoding_options)?;
            let expected = if i + 1 == chunks.len() {
                MessageIsFinalType::Final
            } else {
                MessageIsFinalType::Intermediate
            };
            if headers.chunk_header.is_final != expected {
                return Err(Error::decoding(
                    "Chunk sequence is not terminated by a final chunk",
                ));
            }
            payload.extend_from_slice(&chunk.data[headers.body]);
        }

        // The payload leads with the node id of the message's binary encoding
        let mut stream = Cursor::new(payload);
        let node_id = NodeId::decode(&mut stream, &decoding_options)?;
        if let Some(expected) = expected_node_id {
            if node_id != expected {
                return Err(Error::decoding(format!(
                    "The message ID {node_id} is not the expected value {expected}"
                )));
            }
        }
        let object_id = node_id
            .as_object_id()
            .map_err(|_| Error::decoding(format!("The message id {node_id} is not an object id")))?;
        T::decode_by_object_id(&mut stream, object_id, &decoding_options)
    }
}
