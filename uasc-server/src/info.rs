//! Server state shared by every secure channel: certificate, private key,
//! endpoints and the channel id allocator.

use uasc_core::handle::AtomicHandle;
use uasc_crypto::{CertificateValidator, PrivateKey, SecurityPolicy, X509};
use uasc_types::{DecodingOptions, MessageSecurityMode, UAString};

use crate::config::ChannelConfig;
use crate::endpoint::ServerEndpoint;

/// State shared between all the secure channels of a server. A channel holds
/// a non-owning reference; channels never mutate this except through the
/// channel id allocator.
pub struct ServerInfo {
    /// The application URI of the server.
    pub application_uri: UAString,
    /// Server public certificate, or `None` when every endpoint is
    /// unsecured.
    pub server_certificate: Option<X509>,
    /// Server private key, paired with the certificate.
    pub server_pkey: Option<PrivateKey>,
    /// The endpoints the server exposes.
    pub endpoints: Vec<ServerEndpoint>,
    /// Channel configuration.
    pub config: ChannelConfig,
    /// Generator for secure channel ids, unique within the process.
    pub secure_channel_id_handle: AtomicHandle,
    /// Validator applied to client certificates during the handshake.
    pub validator: CertificateValidator,
}

impl ServerInfo {
    /// Create server info from its parts.
    pub fn new(
        application_uri: impl Into<UAString>,
        config: ChannelConfig,
        server_certificate: Option<X509>,
        server_pkey: Option<PrivateKey>,
        endpoints: Vec<ServerEndpoint>,
    ) -> ServerInfo {
        ServerInfo {
            application_uri: application_uri.into(),
            server_certificate,
            server_pkey,
            endpoints,
            config,
            secure_channel_id_handle: AtomicHandle::new(1),
            validator: CertificateValidator::new(),
        }
    }

    /// `true` if any endpoint supports the supplied security policy and
    /// mode pair.
    pub fn endpoint_supports(
        &self,
        security_policy: SecurityPolicy,
        security_mode: MessageSecurityMode,
    ) -> bool {
        self.endpoints
            .iter()
            .any(|e| e.supports(security_policy, security_mode))
    }

    /// The decoding options channels on this server apply to inbound data.
    pub fn decoding_options(&self) -> DecodingOptions {
        DecodingOptions {
            max_message_size: self.config.max_message_size,
            max_chunk_count: self.config.max_chunk_count,
            ..Default::default()
        }
    }
}

impl From<UAString> for ServerInfo {
    fn from(application_uri: UAString) -> Self {
        ServerInfo::new(
            application_uri,
            ChannelConfig::default(),
            None,
            None,
            vec![ServerEndpoint::new_none("/")],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_support() {
        let info = ServerInfo::new(
            "urn:uasc:test",
            ChannelConfig::default(),
            None,
            None,
            vec![
                ServerEndpoint::new_none("/"),
                ServerEndpoint::new_basic256_sign_encrypt("/"),
            ],
        );
        assert!(info.endpoint_supports(SecurityPolicy::None, MessageSecurityMode::None));
        assert!(info.endpoint_supports(
            SecurityPolicy::Basic256,
            MessageSecurityMode::SignAndEncrypt
        ));
        assert!(!info.endpoint_supports(SecurityPolicy::Basic256, MessageSecurityMode::Sign));
        assert!(
            !info.endpoint_supports(SecurityPolicy::Basic128Rsa15, MessageSecurityMode::Sign)
        );
    }

    #[test]
    fn channel_ids_are_unique() {
        let info = ServerInfo::from(UAString::from("urn:uasc:test"));
        let a = info.secure_channel_id_handle.next();
        let b = info.secure_channel_id_handle.next();
        assert_ne!(a, b);
    }
}
