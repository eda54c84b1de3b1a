//! Transport implementation for the server side of a secure channel:
//! performs the opc.tcp connection handshake, reassembles inbound chunks
//! into requests and drains the send buffer.

use futures::StreamExt;
use log::{debug, error, trace};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::Instant;
use tokio_util::codec::FramedRead;

use uasc_core::comms::buffer::SendBuffer;
use uasc_core::comms::channel_security::ChannelSecurity;
use uasc_core::comms::chunker::Chunker;
use uasc_core::comms::message_chunk::{
    ChunkHeaders, MessageChunk, MessageChunkType, MessageIsFinalType,
};
use uasc_core::comms::tcp_codec::{Message, TcpCodec};
use uasc_core::comms::tcp_types::{AcknowledgeMessage, ErrorMessage};
use uasc_core::{RequestMessage, ResponseMessage};
use uasc_types::{
    Error, ResponseHeader, ServiceFault, SimpleBinaryEncodable, StatusCode,
};

use crate::channel::ChannelError;
use crate::info::ServerInfo;

/// The version of the opc.tcp protocol this server speaks.
const SERVER_PROTOCOL_VERSION: u32 = 0;

/// A request assembled from one or more inbound chunks, not yet surfaced to
/// the upper layer.
#[derive(Debug)]
pub(crate) struct IncomingRequest {
    pub message: RequestMessage,
    pub headers: ChunkHeaders,
    pub request_id: u32,
    /// When the first chunk of the request arrived.
    pub received_first: Instant,
    /// When the last chunk of the request arrived.
    pub received_last: Instant,
}

/// Result of polling the transport.
#[derive(Debug)]
pub(crate) enum TransportPollResult {
    OutgoingMessageSent,
    IncomingChunk,
    IncomingMessage(IncomingRequest),
    Error(StatusCode),
    RecoverableError(StatusCode, u32, u32),
    Closed,
}

enum TransportState {
    Running,
    Closing,
}

fn min_zero_infinite(server: u32, client: u32) -> u32 {
    if client == 0 {
        server
    } else if server == 0 {
        client
    } else {
        client.min(server)
    }
}

/// Framed transport over any async stream. `TcpStream` in production,
/// in-memory pipes in tests.
pub(crate) struct Transport<S> {
    read: FramedRead<ReadHalf<S>, TcpCodec>,
    write: WriteHalf<S>,
    pub(crate) send_buffer: SendBuffer,
    state: TransportState,
    pending_chunks: Vec<MessageChunk>,
    /// Client protocol version set during HELLO
    pub(crate) client_protocol_version: u32,
    /// Last decoded sequence number
    last_received_sequence_number: u32,
    bytes_read: u64,
    bytes_written: u64,
    /// When the first pending chunk arrived
    receive_first: Option<Instant>,
}

async fn send_error_message<W: AsyncWrite + Unpin>(write: &mut W, error: &ErrorMessage) {
    // The connection is failing anyway, nothing to do if this fails too
    let _ = write.write_all(&error.encode_to_vec()).await;
}

/// Accept the opc.tcp connection handshake on a fresh stream: wait for
/// HELLO, validate it and answer with ACK. The deadline covers the wait for
/// HELLO; the caller's open timeout keeps covering the first OPN.
pub(crate) async fn connect<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    info: &ServerInfo,
    deadline: Instant,
) -> Result<Transport<S>, ChannelError> {
    let (read, mut write) = tokio::io::split(stream);
    let mut read = FramedRead::new(read, TcpCodec::new(info.decoding_options()));

    let hello = match tokio::time::timeout_at(deadline, read.next()).await {
        Err(_) => {
            debug!("Timed out waiting for HELLO");
            return Err(ChannelError::Timeout);
        }
        Ok(None) => return Err(ChannelError::Status(StatusCode::BadConnectionClosed)),
        Ok(Some(Err(e))) => return Err(ChannelError::Io(e)),
        Ok(Some(Ok(Message::Hello(hello)))) => hello,
        Ok(Some(Ok(bad_msg))) => {
            let err = ErrorMessage::new(
                StatusCode::BadCommunicationError,
                &format!("Expected a hello message, got {:?} instead", bad_msg),
            );
            send_error_message(&mut write, &err).await;
            return Err(ChannelError::Status(StatusCode::BadCommunicationError));
        }
    };

    let config = &info.config;

    if !hello.is_endpoint_url_valid() {
        let err = ErrorMessage::new(
            StatusCode::BadTcpEndpointUrlInvalid,
            "HELLO endpoint url is invalid",
        );
        send_error_message(&mut write, &err).await;
        return Err(ChannelError::Status(StatusCode::BadTcpEndpointUrlInvalid));
    }
    if !hello.is_valid_buffer_sizes() {
        let err = ErrorMessage::new(
            StatusCode::BadCommunicationError,
            "HELLO buffer sizes are invalid",
        );
        send_error_message(&mut write, &err).await;
        return Err(ChannelError::Status(StatusCode::BadCommunicationError));
    }
    if hello.protocol_version > SERVER_PROTOCOL_VERSION {
        let err = ErrorMessage::new(
            StatusCode::BadProtocolVersionUnsupported,
            "Client protocol version is unsupported",
        );
        send_error_message(&mut write, &err).await;
        return Err(ChannelError::Status(
            StatusCode::BadProtocolVersionUnsupported,
        ));
    }

    let mut send_buffer = SendBuffer::new(
        config.send_buffer_size,
        config.max_message_size,
        config.max_chunk_count,
    );

    // Send acknowledge
    let acknowledge = AcknowledgeMessage::new(
        SERVER_PROTOCOL_VERSION,
        (config.receive_buffer_size as u32).min(hello.send_buffer_size),
        (config.send_buffer_size as u32).min(hello.receive_buffer_size),
        min_zero_infinite(config.max_message_size as u32, hello.max_message_size),
        min_zero_infinite(config.max_chunk_count as u32, hello.max_chunk_count),
    );
    send_buffer.revise(
        acknowledge.send_buffer_size as usize,
        acknowledge.max_message_size as usize,
        acknowledge.max_chunk_count as usize,
    );

    write
        .write_all(&acknowledge.encode_to_vec())
        .await
        .map_err(ChannelError::Io)?;

    Ok(Transport {
        read,
        write,
        send_buffer,
        state: TransportState::Running,
        pending_chunks: Vec::new(),
        client_protocol_version: hello.protocol_version,
        last_received_sequence_number: 0,
        bytes_read: 0,
        bytes_written: 0,
        receive_first: None,
    })
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    /// Set the transport state to closing; once the buffered data is flushed
    /// the connection is dropped.
    pub fn set_closing(&mut self) {
        self.state = TransportState::Closing;
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state, TransportState::Closing)
    }

    /// Total bytes of chunk data received.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Total bytes written to the stream.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Queue a response for sending as a chunk of the supplied type. A
    /// response that fails to encode is replaced with a service fault when
    /// the request context is known.
    pub fn enqueue_message_for_send(
        &mut self,
        security: &mut ChannelSecurity,
        message: ResponseMessage,
        message_type: MessageChunkType,
        request_id: u32,
    ) -> Result<(), StatusCode> {
        match self
            .send_buffer
            .write(request_id, &message, message_type, security)
        {
            Ok(_) => Ok(()),
            Err(e) => {
                log::warn!("Failed to encode outgoing message: {e:?}");
                if let Some((request_id, request_handle)) = e.full_context() {
                    let fault = ResponseMessage::ServiceFault(Box::new(ServiceFault {
                        response_header: ResponseHeader::new_service_result(
                            request_handle,
                            e.into(),
                        ),
                    }));
                    self.send_buffer
                        .write(request_id, &fault, message_type, security)
                        .map_err(StatusCode::from)?;
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
        }
    }

    /// Drain everything queued in the send buffer to the stream without
    /// reading. Used when a response must be flushed before closing.
    pub async fn flush(&mut self, security: &mut ChannelSecurity) -> Result<(), StatusCode> {
        while !self.send_buffer.is_empty() {
            if self.send_buffer.should_encode_chunks() {
                self.send_buffer.encode_next_chunk(security)?;
            }
            if self.send_buffer.can_read() {
                let written = self
                    .send_buffer
                    .read_into_async(&mut self.write)
                    .await
                    .map_err(|e| {
                        error!("write bytes task failed: {}", e);
                        StatusCode::BadConnectionClosed
                    })?;
                self.bytes_written += written as u64;
            }
        }
        Ok(())
    }

    /// Shut down the write half, best effort.
    pub async fn shutdown(&mut self) {
        let _ = self.write.shutdown().await;
    }

    /// Poll the transport once: write buffered data if there is any, and
    /// receive inbound messages.
    pub async fn poll(&mut self, security: &mut ChannelSecurity) -> TransportPollResult {
        // If there's nothing in the byte buffer, but there are chunks
        // available, secure them into the byte buffer before proceeding.
        if self.send_buffer.should_encode_chunks() {
            if let Err(e) = self.send_buffer.encode_next_chunk(security) {
                return TransportPollResult::Error(e.status());
            }
        }

        // If there is something in the send buffer, write to the stream.
        // If not, wait for incoming messages only.
        if self.send_buffer.can_read() {
            tokio::select! {
                r = self.send_buffer.read_into_async(&mut self.write) => {
                    match r {
                        Err(e) => {
                            error!("write bytes task failed: {}", e);
                            TransportPollResult::Closed
                        }
                        Ok(written) => {
                            self.bytes_written += written as u64;
                            TransportPollResult::OutgoingMessageSent
                        }
                    }
                }
                incoming = self.read.next() => {
                    self.handle_incoming_message(incoming, security)
                }
            }
        } else {
            if self.is_closing() {
                return TransportPollResult::Closed;
            }
            let incoming = self.read.next().await;
            self.handle_incoming_message(incoming, security)
        }
    }

    fn handle_incoming_message(
        &mut self,
        incoming: Option<Result<Message, std::io::Error>>,
        security: &mut ChannelSecurity,
    ) -> TransportPollResult {
        let Some(incoming) = incoming else {
            return TransportPollResult::Closed;
        };
        match incoming {
            Ok(message) => match self.process_message(message, security) {
                Ok(None) => TransportPollResult::IncomingChunk,
                Ok(Some(message)) => {
                    self.pending_chunks.clear();
                    self.receive_first = None;
                    TransportPollResult::IncomingMessage(message)
                }
                Err(e) => {
                    self.pending_chunks.clear();
                    self.receive_first = None;
                    if let Some((id, handle)) = e.full_context() {
                        TransportPollResult::RecoverableError(e.status(), id, handle)
                    } else {
                        TransportPollResult::Error(e.status())
                    }
                }
            },
            Err(err) => {
                error!("Error reading from stream {:?}", err);
                TransportPollResult::Error(StatusCode::BadConnectionClosed)
            }
        }
    }

    fn process_message(
        &mut self,
        message: Message,
        security: &mut ChannelSecurity,
    ) -> Result<Option<IncomingRequest>, Error> {
        match message {
            Message::Chunk(chunk) => {
                self.bytes_read += chunk.data.len() as u64;
                if self.pending_chunks.is_empty() {
                    self.receive_first = Some(Instant::now());
                }

                let header = chunk.message_header(&security.decoding_options())?;

                if header.is_final == MessageIsFinalType::FinalError {
                    trace!("Discarding chunks of an aborted message");
                    self.pending_chunks.clear();
                    self.receive_first = None;
                    Ok(None)
                } else {
                    let chunk = security.unsecure_incoming_chunk(&chunk.data)?;

                    if self.send_buffer.max_chunk_count > 0
                        && self.pending_chunks.len() == self.send_buffer.max_chunk_count
                    {
                        return Err(Error::decoding(format!(
                            "Message has more than {} chunks, exceeding negotiated limits",
                            self.send_buffer.max_chunk_count
                        )));
                    }
                    self.pending_chunks.push(chunk);

                    if header.is_final == MessageIsFinalType::Intermediate {
                        return Ok(None);
                    }

                    let headers =
                        self.pending_chunks[0].headers(&security.decoding_options())?;

                    self.last_received_sequence_number = Chunker::validate_chunks(
                        self.last_received_sequence_number + 1,
                        security,
                        &self.pending_chunks,
                    )?;

                    let request = Chunker::decode(&self.pending_chunks, security, None)
                        .map_err(|e| e.with_request_id(headers.sequence_header.request_id))?;
                    Ok(Some(IncomingRequest {
                        request_id: headers.sequence_header.request_id,
                        headers,
                        message: request,
                        received_first: self.receive_first.unwrap_or_else(Instant::now),
                        received_last: Instant::now(),
                    }))
                }
            }
            unexpected => Err(Error::new(
                StatusCode::BadUnexpectedError,
                format!("Received unexpected message: {:?}", unexpected),
            )),
        }
    }
}
