//! The observable surface of a channel: decoded requests, transaction
//! statistics and termination, delivered through an observer trait
//! registered at construction.

use std::time::Duration;

use tokio::time::Instant;

use uasc_core::RequestMessage;
use uasc_types::StatusCode;

/// Correlation data for a request. Returned to the channel with the response
/// so it can be matched to the request, and carried in errors.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    /// The id the transport assigned to the request. Always non-zero.
    pub request_id: u32,
    /// The client's request handle, copied into the response header.
    pub request_handle: u32,
    /// When the first chunk of the request arrived.
    pub received_first: Instant,
    /// When the last chunk of the request arrived.
    pub received_last: Instant,
}

/// A decoded request surfaced to the service dispatcher above the channel.
#[derive(Debug)]
pub struct Request {
    /// The decoded request message.
    pub message: RequestMessage,
    /// Correlation data to pass back with the response.
    pub context: RequestContext,
}

/// Statistics for one completed transaction, emitted once the final chunk of
/// the response has been handed to the transport.
#[derive(Debug, Clone)]
pub struct TransactionStats {
    /// The request id of the transaction.
    pub request_id: u32,
    /// Bytes read from the transport since the previous transaction.
    pub bytes_read: u64,
    /// Bytes written to the transport since the previous transaction.
    pub bytes_written: u64,
    /// First chunk received to last chunk received.
    pub lap_reception: Duration,
    /// Last chunk received to response send start.
    pub lap_processing: Duration,
    /// Send start to send complete.
    pub lap_emission: Duration,
}

/// Observer for channel events. All callbacks run on the channel's own
/// task, strictly serialised; implementations should hand work off rather
/// than block.
pub trait ChannelEvents: Send + Sync {
    /// A non-handshake request was decoded. The dispatcher answers it later
    /// through [`crate::SecureChannelHandle::send_response`] or
    /// [`crate::SecureChannelHandle::send_error_and_abort`].
    fn message(&self, request: Request);

    /// The response to a request has been fully handed to the transport.
    fn transaction_done(&self, stats: TransactionStats);

    /// The channel terminated. Emitted exactly once, with `Good` for an
    /// orderly close and the failure status otherwise.
    fn abort(&self, status: StatusCode);
}
