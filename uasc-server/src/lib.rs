//! Server-side secure channel layer: accepts a framed opc.tcp connection,
//! performs the open-secure-channel handshake, maintains and renews the
//! channel's security token, and shuttles decoded requests and responses
//! between the transport and a service dispatcher.

mod channel;
mod config;
mod endpoint;
mod events;
mod handshake;
mod info;
mod token;
mod transport;

pub use channel::{ChannelError, ChannelState, OutgoingMessage, SecureChannelHandle, ServerSecureChannel};
pub use config::{ChannelConfig, ConfigError};
pub use endpoint::ServerEndpoint;
pub use events::{ChannelEvents, Request, RequestContext, TransactionStats};
pub use info::ServerInfo;
pub use token::TokenManager;
