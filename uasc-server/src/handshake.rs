//! The open-secure-channel handshake: validates the request, negotiates
//! policy and mode, captures the client certificate and nonce, installs a
//! fresh token and derived keys, and builds the response.

use log::{debug, error, warn};

use uasc_core::comms::channel_security::ChannelSecurity;
use uasc_core::comms::message_chunk::ChunkHeaders;
use uasc_core::comms::security_header::SecurityHeader;
use uasc_core::{RequestMessage, ResponseMessage};
use uasc_crypto::{KeySize, SecurityPolicy};
use uasc_types::{
    MessageSecurityMode, OpenSecureChannelResponse, ResponseHeader, SecurityTokenRequestType,
    ServiceFault, StatusCode,
};

use crate::info::ServerInfo;
use crate::token::TokenManager;

/// What the handshake decided: the response to send and the service result
/// that determines whether the channel stays up afterwards.
pub(crate) struct HandshakeOutcome {
    pub response: ResponseMessage,
    pub service_result: StatusCode,
    pub request_type: SecurityTokenRequestType,
}

fn fault(
    request_handle: u32,
    service_result: StatusCode,
    request_type: SecurityTokenRequestType,
) -> HandshakeOutcome {
    HandshakeOutcome {
        response: ResponseMessage::ServiceFault(Box::new(ServiceFault {
            response_header: ResponseHeader::new_service_result(request_handle, service_result),
        })),
        service_result,
        request_type,
    }
}

/// Process one open secure channel request, for both the initial issue and
/// subsequent renewals. The processing order and the resulting status codes
/// follow Part 4 and Part 6; the certificate-validity fault takes precedence
/// over a thumbprint mismatch because it replaces the response outright.
pub(crate) fn process_open_secure_channel(
    security: &mut ChannelSecurity,
    tokens: &mut TokenManager,
    info: &ServerInfo,
    message: &RequestMessage,
    headers: &ChunkHeaders,
) -> HandshakeOutcome {
    let request_handle = message.request_header().request_handle;

    // The message must be an OpenSecureChannelRequest
    let RequestMessage::OpenSecureChannel(request) = message else {
        error!("Expected an OpenSecureChannelRequest, got something else");
        return fault(
            request_handle,
            StatusCode::BadCommunicationError,
            SecurityTokenRequestType::Issue,
        );
    };
    let request_type = request.request_type;

    // The security policy comes from the chunk's asymmetric header
    let SecurityHeader::Asymmetric(security_header) = &headers.security_header else {
        error!("OPN chunk did not carry an asymmetric security header");
        return fault(
            request_handle,
            StatusCode::BadSecurityChecksFailed,
            request_type,
        );
    };
    let security_policy = if security_header.security_policy_uri.is_null() {
        SecurityPolicy::None
    } else {
        SecurityPolicy::from_uri(security_header.security_policy_uri.as_ref())
    };
    if security_policy == SecurityPolicy::Unknown {
        warn!(
            "Rejecting OPN with unknown security policy {}",
            security_header.security_policy_uri
        );
        return fault(
            request_handle,
            StatusCode::BadSecurityPolicyRejected,
            request_type,
        );
    }

    // Adopt the requested mode; an invalid mode can never match an endpoint
    let security_mode = request.security_mode;
    if security_mode == MessageSecurityMode::Invalid {
        return fault(
            request_handle,
            StatusCode::BadSecurityModeRejected,
            request_type,
        );
    }
    security.set_security_policy(security_policy);
    security.set_security_mode(security_mode);

    // There must be an endpoint willing to talk like this
    if !info.endpoint_supports(security_policy, security_mode) {
        warn!(
            "Rejecting OPN, no endpoint supports policy {} with mode {}",
            security_policy, security_mode
        );
        return fault(
            request_handle,
            StatusCode::BadSecurityPolicyRejected,
            request_type,
        );
    }

    // Cache the client certificate. A zero length certificate is treated as
    // absent.
    if let Err(status) =
        security.set_peer_certificate_from_bytes(&security_header.sender_certificate)
    {
        return fault(request_handle, status, request_type);
    }

    // The client's RSA key must be within the range the policy allows
    if security_policy != SecurityPolicy::None {
        if let Some(cert) = security.peer_certificate() {
            let Ok(public_key) = cert.public_key() else {
                return fault(request_handle, StatusCode::BadCertificateInvalid, request_type);
            };
            if !security_policy.is_valid_keylength(public_key.bit_length()) {
                warn!(
                    "Client certificate key is {} bits, outside the range allowed by {}",
                    public_key.bit_length(),
                    security_policy
                );
                return fault(request_handle, StatusCode::BadCertificateInvalid, request_type);
            }
        }
    }

    // Capture the client nonce; its length is validated against the policy
    // below
    security.set_peer_nonce(request.client_nonce.as_ref());

    // Allocate the token. Issue and renew differ only in intent; the
    // predecessor token stays valid for the grace window either way.
    if security.secure_channel_id() == 0 {
        security.set_secure_channel_id(info.secure_channel_id_handle.next());
    }
    let token = match request_type {
        SecurityTokenRequestType::Issue => {
            tokens.issue(security.secure_channel_id(), request.requested_lifetime)
        }
        SecurityTokenRequestType::Renew => {
            tokens.renew(security.secure_channel_id(), request.requested_lifetime)
        }
    };
    security.set_security_token(&token);

    let mut service_result = StatusCode::Good;

    // Compute the server nonce and derive the keys
    if security_policy != SecurityPolicy::None {
        security.create_nonce();
        if security.peer_nonce().len() != security.own_nonce().len() {
            // The client's nonce does not match the policy's symmetric key
            // length. Of the possible outcomes - truncating, deriving anyway,
            // rejecting - this stack rejects.
            warn!(
                "Client nonce is {} bytes, policy {} requires {}",
                security.peer_nonce().len(),
                security_policy,
                security.own_nonce().len()
            );
            service_result = StatusCode::BadSecurityModeRejected;
        } else {
            security.derive_keys();
        }
    }

    // Verify the receiver certificate thumbprint names our certificate.
    // Comparison is byte-exact on the lowercase hex form.
    if security_mode != MessageSecurityMode::None && service_result.is_good() {
        let expected = info
            .server_certificate
            .as_ref()
            .map(|cert| cert.thumbprint().as_hex_string());
        let received = security_header.receiver_certificate_thumbprint.value.as_ref().map(|v| {
            v.iter().map(|b| format!("{:02x}", b)).collect::<String>()
        });
        if expected.is_none() || received.is_none() || expected != received {
            warn!(
                "Receiver certificate thumbprint {:?} does not match the server certificate",
                received
            );
            service_result = StatusCode::BadCertificateInvalid;
        }
    }

    // Validate the client certificate itself. A failure here replaces the
    // whole response with a fault, taking precedence over the thumbprint
    // result above.
    if security_mode != MessageSecurityMode::None {
        let validation_result = info.validator.validate(security.peer_certificate());
        if validation_result.is_bad() {
            return fault(request_handle, validation_result, request_type);
        }
    }

    debug!(
        "Open secure channel, {:?} on channel {} with token {}, result {}",
        request_type,
        token.channel_id,
        token.token_id,
        service_result
    );

    HandshakeOutcome {
        response: ResponseMessage::OpenSecureChannel(Box::new(OpenSecureChannelResponse {
            response_header: ResponseHeader::new_service_result(request_handle, service_result),
            server_protocol_version: 0,
            security_token: token,
            server_nonce: security.own_nonce_as_byte_string(),
        })),
        service_result,
        request_type,
    }
}
