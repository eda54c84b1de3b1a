// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Validation of client certificates presented during the secure channel
//! handshake.

use log::warn;

use uasc_types::{DateTime, StatusCode};

use crate::x509::X509;

/// Validates certificates presented by the remote side of a channel.
///
/// Today this checks presence and the validity window. Trust, revocation and
/// hostname checks are stubs so that a complete PKI can be slotted in
/// without touching the handshake.
#[derive(Debug, Default)]
pub struct CertificateValidator;

impl CertificateValidator {
    /// Create a validator.
    pub fn new() -> CertificateValidator {
        CertificateValidator
    }

    /// Validate the supplied certificate. A missing certificate fails with
    /// `BadSecurityChecksFailed`, one outside its validity window with
    /// `BadCertificateTimeInvalid`.
    pub fn validate(&self, certificate: Option<&X509>) -> StatusCode {
        let Some(certificate) = certificate else {
            warn!("Client did not supply a certificate, rejecting");
            return StatusCode::BadSecurityChecksFailed;
        };
        let now = DateTime::now();
        let result = certificate.is_time_valid(&now);
        if result.is_bad() {
            return result;
        }
        let result = self.verify_trust(certificate);
        if result.is_bad() {
            return result;
        }
        let result = self.verify_revocation(certificate);
        if result.is_bad() {
            return result;
        }
        self.verify_hostnames(certificate)
    }

    // TODO trust chain validation against a certificate store, see the
    // matching gap in the handshake documentation.
    fn verify_trust(&self, _certificate: &X509) -> StatusCode {
        StatusCode::Good
    }

    // TODO revocation list checks.
    fn verify_revocation(&self, _certificate: &X509) -> StatusCode {
        StatusCode::Good
    }

    // TODO hostname / application URI cross-checks.
    fn verify_hostnames(&self, _certificate: &X509) -> StatusCode {
        StatusCode::Good
    }
}
