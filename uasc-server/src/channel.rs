//! The server secure channel: lifecycle control, the steady-state event
//! loop, request/response correlation and transaction statistics.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use log::{debug, error, warn};
use thiserror::Error as ThisError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;

use uasc_core::comms::channel_security::ChannelSecurity;
use uasc_core::comms::message_chunk::MessageChunkType;
use uasc_core::comms::security_header::SecurityHeader;
use uasc_core::{Message, MessageType, ResponseMessage};
use uasc_types::{ByteString, ServiceFault, StatusCode};

use crate::events::{ChannelEvents, Request, RequestContext, TransactionStats};
use crate::handshake;
use crate::info::ServerInfo;
use crate::token::TokenManager;
use crate::transport::{self, IncomingRequest, Transport, TransportPollResult};

/// Errors surfaced by channel operations.
#[derive(Debug, ThisError)]
pub enum ChannelError {
    /// The channel did not open within the configured timeout.
    #[error("timed out waiting for the channel to open")]
    Timeout,
    /// The channel failed with a protocol status code.
    #[error("channel failed with status {0}")]
    Status(StatusCode),
    /// The underlying stream failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<uasc_types::Error> for ChannelError {
    fn from(value: uasc_types::Error) -> Self {
        ChannelError::Status(value.status())
    }
}

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Transport is connected, the first open secure channel request has not
    /// arrived yet.
    AwaitingOpen,
    /// The channel is open and carrying traffic. Renewals self-loop here.
    Open,
    /// The channel terminated. Terminal state.
    Aborted,
}

/// A message for the channel to send, queued through its handle.
#[derive(Debug)]
pub enum OutgoingMessage {
    /// A response to a decoded request.
    Response {
        /// The response message. Its request handle is overwritten from the
        /// context before sending.
        response: ResponseMessage,
        /// The context of the request being answered.
        context: RequestContext,
    },
    /// A service fault to send before tearing the channel down.
    ErrorAndAbort {
        /// The service result of the fault.
        status: StatusCode,
        /// Human readable description, logged but not transmitted.
        description: String,
        /// The context of the request being answered.
        context: RequestContext,
    },
    /// Close the channel after flushing queued responses.
    Close,
    /// Bind an opaque session token to this channel.
    BindSessionToken(ByteString),
    /// Remove a previously bound session token.
    UnbindSessionToken(ByteString),
}

/// Handle for the service dispatcher to answer requests and close the
/// channel. Cloneable and cheap.
#[derive(Debug, Clone)]
pub struct SecureChannelHandle {
    sender: mpsc::UnboundedSender<OutgoingMessage>,
}

impl SecureChannelHandle {
    /// Send a response to a previously surfaced request. The request handle
    /// of the original request is copied into the response header.
    pub fn send_response(
        &self,
        response: ResponseMessage,
        context: RequestContext,
    ) -> Result<(), ChannelError> {
        assert!(context.request_id > 0, "request id must be non-zero");
        self.sender
            .send(OutgoingMessage::Response { response, context })
            .map_err(|_| ChannelError::Status(StatusCode::BadSecureChannelClosed))
    }

    /// Send a service fault carrying `status` as the service result, then
    /// close the channel once the fault has flushed.
    pub fn send_error_and_abort(
        &self,
        status: StatusCode,
        description: &str,
        context: RequestContext,
    ) -> Result<(), ChannelError> {
        assert!(context.request_id > 0, "request id must be non-zero");
        self.sender
            .send(OutgoingMessage::ErrorAndAbort {
                status,
                description: description.to_string(),
                context,
            })
            .map_err(|_| ChannelError::Status(StatusCode::BadSecureChannelClosed))
    }

    /// Close the channel after queued responses have flushed. Idempotent;
    /// calls after the channel terminated are no-ops.
    pub fn close(&self) {
        let _ = self.sender.send(OutgoingMessage::Close);
    }

    /// Bind an opaque session token to this channel. Sessions are owned by
    /// the layer above; the channel only tracks which ones ride on it.
    pub fn bind_session_token(&self, token: ByteString) {
        let _ = self.sender.send(OutgoingMessage::BindSessionToken(token));
    }

    /// Remove a previously bound session token.
    pub fn unbind_session_token(&self, token: ByteString) {
        let _ = self.sender.send(OutgoingMessage::UnbindSessionToken(token));
    }
}

struct PendingSend {
    context: RequestContext,
    send_started: Instant,
}

/// The server side of one secure channel, bound to one connection. Drives
/// the transport, the handshake and the token lifecycle on a single task;
/// the service dispatcher above communicates through [`ChannelEvents`] and
/// the [`SecureChannelHandle`].
pub struct ServerSecureChannel<S> {
    transport: Transport<S>,
    security: ChannelSecurity,
    info: Arc<ServerInfo>,
    tokens: TokenManager,
    state: ChannelState,
    events: Arc<dyn ChannelEvents>,
    outgoing_rx: mpsc::UnboundedReceiver<OutgoingMessage>,
    outgoing_tx: mpsc::UnboundedSender<OutgoingMessage>,
    pending_sends: VecDeque<PendingSend>,
    /// Opaque tokens of the sessions bound to this channel by the layer
    /// above.
    session_tokens: HashSet<ByteString>,
    /// Status to terminate with once the send buffer has flushed.
    close_status: Option<StatusCode>,
    last_bytes_read: u64,
    last_bytes_written: u64,
    transactions_count: u64,
    /// Development aid: request ids already responded to. Grows without
    /// bound, so debug builds only.
    #[cfg(debug_assertions)]
    responded: std::collections::HashSet<u32>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ServerSecureChannel<S> {
    /// Bind a freshly accepted stream to a new secure channel: performs the
    /// opc.tcp HELLO/ACK exchange and waits for the first open secure
    /// channel request, all within the configured open timeout.
    ///
    /// Resolves once the first OPN has been answered successfully. Any
    /// failure before that point - timeout, transport error, handshake
    /// rejection - is returned here and no `abort` event is emitted, since
    /// the channel never reached the open state.
    pub async fn init(
        stream: S,
        info: Arc<ServerInfo>,
        events: Arc<dyn ChannelEvents>,
    ) -> Result<(Self, SecureChannelHandle), ChannelError> {
        let deadline = Instant::now() + info.config.open_timeout();
        let transport = transport::connect(stream, &info, deadline).await?;

        let mut security = ChannelSecurity::new(info.decoding_options());
        security.set_own_certificate(info.server_certificate.clone());
        security.set_own_private_key(info.server_pkey.clone());

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let tokens = TokenManager::new(info.config.default_token_lifetime_ms);

        let mut this = ServerSecureChannel {
            transport,
            security,
            info,
            tokens,
            state: ChannelState::AwaitingOpen,
            events,
            outgoing_rx,
            outgoing_tx,
            pending_sends: VecDeque::new(),
            session_tokens: HashSet::new(),
            close_status: None,
            last_bytes_read: 0,
            last_bytes_written: 0,
            transactions_count: 0,
            #[cfg(debug_assertions)]
            responded: std::collections::HashSet::new(),
        };

        this.wait_for_initial_open(deadline).await?;
        let handle = this.handle();
        Ok((this, handle))
    }

    /// A handle to answer requests and close the channel.
    pub fn handle(&self) -> SecureChannelHandle {
        SecureChannelHandle {
            sender: self.outgoing_tx.clone(),
        }
    }

    /// The lifecycle state of the channel.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// The id assigned to this channel, unique within the process.
    pub fn secure_channel_id(&self) -> u32 {
        self.security.secure_channel_id()
    }

    /// The number of completed transactions.
    pub fn transactions_count(&self) -> u64 {
        self.transactions_count
    }

    /// The session tokens currently bound to this channel.
    pub fn session_tokens(&self) -> &HashSet<ByteString> {
        &self.session_tokens
    }

    /// The protocol version the client announced in its hello message.
    pub fn client_protocol_version(&self) -> u32 {
        self.transport.client_protocol_version
    }

    async fn wait_for_initial_open(&mut self, deadline: Instant) -> Result<(), ChannelError> {
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("Timed out waiting for the initial open secure channel request");
                    self.transport.shutdown().await;
                    return Err(ChannelError::Timeout);
                }
                r = self.transport.poll(&mut self.security) => match r {
                    TransportPollResult::IncomingMessage(request) => {
                        // The initial-open timer is considered cancelled from
                        // here, whatever the outcome
                        return self.handle_initial_open(request).await;
                    }
                    TransportPollResult::OutgoingMessageSent | TransportPollResult::IncomingChunk => {}
                    TransportPollResult::RecoverableError(status, _, handle) => {
                        return self.fail_initial_open(status, handle).await;
                    }
                    TransportPollResult::Error(status) => {
                        // A failure to even decode the first request: report
                        // it, then give up
                        return self.fail_initial_open(status, 0).await;
                    }
                    TransportPollResult::Closed => {
                        return Err(ChannelError::Status(StatusCode::BadConnectionClosed));
                    }
                }
            }
        }
    }

    async fn handle_initial_open(&mut self, request: IncomingRequest) -> Result<(), ChannelError> {
        let outcome = handshake::process_open_secure_channel(
            &mut self.security,
            &mut self.tokens,
            &self.info,
            &request.message,
            &request.headers,
        );
        let service_result = outcome.service_result;
        self.transport
            .enqueue_message_for_send(
                &mut self.security,
                outcome.response,
                MessageChunkType::OpenSecureChannel,
                request.request_id,
            )
            .map_err(ChannelError::Status)?;
        self.transport
            .flush(&mut self.security)
            .await
            .map_err(ChannelError::Status)?;

        if service_result.is_good() {
            debug!(
                "Channel {} is now open ({:?})",
                self.security.secure_channel_id(),
                outcome.request_type
            );
            self.state = ChannelState::Open;
            Ok(())
        } else {
            // The client got a well formed rejection; the channel is dead
            self.transport.shutdown().await;
            Err(ChannelError::Status(service_result))
        }
    }

    async fn fail_initial_open(
        &mut self,
        status: StatusCode,
        request_handle: u32,
    ) -> Result<(), ChannelError> {
        warn!("Initial open secure channel failed: {}", status);
        let fault = ResponseMessage::from(ServiceFault::new(request_handle, status));
        // The request never decoded, so there is no request id to echo
        if self
            .transport
            .enqueue_message_for_send(
                &mut self.security,
                fault,
                MessageChunkType::OpenSecureChannel,
                1,
            )
            .is_ok()
        {
            let _ = self.transport.flush(&mut self.security).await;
        }
        self.transport.shutdown().await;
        Err(ChannelError::Status(status))
    }

    /// Run the channel until it terminates, then emit `abort` exactly once.
    /// Spawn this on its own task after a successful [`Self::init`].
    pub async fn run(mut self) {
        let status = self.run_inner().await;
        self.abort(status).await;
    }

    async fn run_inner(&mut self) -> StatusCode {
        loop {
            let watchdog = self.tokens.watchdog_deadline();
            tokio::select! {
                r = self.transport.poll(&mut self.security) => match r {
                    TransportPollResult::OutgoingMessageSent => {
                        if self.transport.send_buffer.is_empty() {
                            self.complete_pending_sends();
                            if let Some(status) = self.close_status {
                                return status;
                            }
                        }
                    }
                    TransportPollResult::IncomingChunk => {}
                    TransportPollResult::IncomingMessage(request) => {
                        if let Some(status) = self.handle_incoming(request) {
                            return status;
                        }
                    }
                    TransportPollResult::RecoverableError(status, request_id, request_handle) => {
                        warn!("Recoverable error {} on request {}", status, request_id);
                        let fault = ResponseMessage::from(ServiceFault::new(request_handle, status));
                        if let Err(status) = self.transport.enqueue_message_for_send(
                            &mut self.security,
                            fault,
                            MessageChunkType::Message,
                            request_id,
                        ) {
                            return status;
                        }
                    }
                    TransportPollResult::Error(status) => {
                        // Transport and decoder failures are fatal, no
                        // response is attempted
                        return status;
                    }
                    TransportPollResult::Closed => {
                        return self.close_status.unwrap_or(StatusCode::BadConnectionClosed);
                    }
                },
                outgoing = self.outgoing_rx.recv() => {
                    // The channel keeps its own sender, so recv never yields None
                    if let Some(outgoing) = outgoing {
                        if let Some(status) = self.handle_outgoing(outgoing) {
                            return status;
                        }
                    }
                }
                _ = Self::watchdog_wait(watchdog) => {
                    self.tokens.on_watchdog_fired();
                }
            }
        }
    }

    async fn watchdog_wait(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => futures::future::pending().await,
        }
    }

    fn handle_incoming(&mut self, request: IncomingRequest) -> Option<StatusCode> {
        match request.message.message_type() {
            MessageChunkType::OpenSecureChannel => self.handle_renewal(request),
            MessageChunkType::CloseSecureChannel => {
                debug!(
                    "Close secure channel request on channel {}",
                    self.security.secure_channel_id()
                );
                // No response is sent to CLO, the transport just closes
                Some(StatusCode::Good)
            }
            MessageChunkType::Message => {
                let token_id = match &request.headers.security_header {
                    SecurityHeader::Symmetric(header) => header.token_id,
                    SecurityHeader::Asymmetric(_) => 0,
                };
                if !self.tokens.is_token_valid(token_id) {
                    warn!(
                        "Request {} secured with unknown or expired token {}",
                        request.request_id, token_id
                    );
                    let fault = ResponseMessage::from(ServiceFault::new(
                        request.message.request_handle(),
                        StatusCode::BadSecureChannelTokenUnknown,
                    ));
                    if let Err(status) = self.transport.enqueue_message_for_send(
                        &mut self.security,
                        fault,
                        MessageChunkType::Message,
                        request.request_id,
                    ) {
                        return Some(status);
                    }
                    self.begin_close(StatusCode::BadSecureChannelTokenUnknown);
                    return None;
                }
                // The newest token is in use, retire its predecessor
                self.tokens.mark_token_used(token_id);
                self.security.retire_superseded_keys(token_id);

                let context = RequestContext {
                    request_id: request.request_id,
                    request_handle: request.message.request_handle(),
                    received_first: request.received_first,
                    received_last: request.received_last,
                };
                debug_assert!(context.request_id > 0);
                self.events.message(Request {
                    message: request.message,
                    context,
                });
                None
            }
        }
    }

    fn handle_renewal(&mut self, request: IncomingRequest) -> Option<StatusCode> {
        let context = RequestContext {
            request_id: request.request_id,
            request_handle: request.message.request_header().request_handle,
            received_first: request.received_first,
            received_last: request.received_last,
        };
        let outcome = handshake::process_open_secure_channel(
            &mut self.security,
            &mut self.tokens,
            &self.info,
            &request.message,
            &request.headers,
        );
        let service_result = outcome.service_result;
        if let Err(status) = self.transport.enqueue_message_for_send(
            &mut self.security,
            outcome.response,
            MessageChunkType::OpenSecureChannel,
            request.request_id,
        ) {
            return Some(status);
        }
        self.pending_sends.push_back(PendingSend {
            context,
            send_started: Instant::now(),
        });
        if !service_result.is_good() {
            self.begin_close(service_result);
        }
        None
    }

    fn handle_outgoing(&mut self, outgoing: OutgoingMessage) -> Option<StatusCode> {
        match outgoing {
            OutgoingMessage::Response {
                mut response,
                context,
            } => {
                #[cfg(debug_assertions)]
                {
                    assert!(
                        self.responded.insert(context.request_id),
                        "a response for request id {} was already sent on this channel",
                        context.request_id
                    );
                }
                // This is how the client correlates response to request
                response.response_header_mut().request_handle = context.request_handle;
                let send_started = Instant::now();
                let message_type = response.message_type();
                if let Err(status) = self.transport.enqueue_message_for_send(
                    &mut self.security,
                    response,
                    message_type,
                    context.request_id,
                ) {
                    error!("Failed to enqueue response: {}", status);
                    return Some(status);
                }
                self.pending_sends.push_back(PendingSend {
                    context,
                    send_started,
                });
                None
            }
            OutgoingMessage::ErrorAndAbort {
                status,
                description,
                context,
            } => {
                warn!(
                    "Sending fault {} for request {} and closing: {}",
                    status, context.request_id, description
                );
                let fault =
                    ResponseMessage::from(ServiceFault::new(context.request_handle, status));
                if let Err(status) = self.transport.enqueue_message_for_send(
                    &mut self.security,
                    fault,
                    MessageChunkType::Message,
                    context.request_id,
                ) {
                    return Some(status);
                }
                self.pending_sends.push_back(PendingSend {
                    context,
                    send_started: Instant::now(),
                });
                self.begin_close(status);
                None
            }
            OutgoingMessage::Close => {
                self.begin_close(StatusCode::Good);
                if self.transport.send_buffer.is_empty() {
                    Some(StatusCode::Good)
                } else {
                    None
                }
            }
            OutgoingMessage::BindSessionToken(token) => {
                self.session_tokens.insert(token);
                None
            }
            OutgoingMessage::UnbindSessionToken(token) => {
                self.session_tokens.remove(&token);
                None
            }
        }
    }

    fn begin_close(&mut self, status: StatusCode) {
        if self.close_status.is_none() {
            self.close_status = Some(status);
        }
        self.transport.set_closing();
    }

    fn complete_pending_sends(&mut self) {
        if self.pending_sends.is_empty() {
            return;
        }
        let now = Instant::now();
        let bytes_read = self.transport.bytes_read();
        let bytes_written = self.transport.bytes_written();
        while let Some(send) = self.pending_sends.pop_front() {
            let stats = TransactionStats {
                request_id: send.context.request_id,
                bytes_read: bytes_read - self.last_bytes_read,
                bytes_written: bytes_written - self.last_bytes_written,
                lap_reception: send.context.received_last - send.context.received_first,
                lap_processing: send.send_started - send.context.received_last,
                lap_emission: now - send.send_started,
            };
            self.last_bytes_read = bytes_read;
            self.last_bytes_written = bytes_written;
            self.transactions_count += 1;
            self.events.transaction_done(stats);
        }
    }

    /// Terminate the channel: cancel the watchdog, wipe key material, close
    /// the transport and emit `abort`. Emits at most once; later calls are
    /// no-ops.
    async fn abort(&mut self, status: StatusCode) {
        if self.state == ChannelState::Aborted {
            return;
        }
        self.state = ChannelState::Aborted;
        debug!(
            "Channel {} aborted with status {}, {} bound sessions",
            self.security.secure_channel_id(),
            status,
            self.session_tokens.len()
        );
        self.session_tokens.clear();
        self.tokens.clear();
        self.security.wipe_security_material();
        self.transport.shutdown().await;
        self.events.abort(status);
    }
}
