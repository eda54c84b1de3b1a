// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! X.509 certificate handling: parsing DER certificates received over the
//! wire, pulling out the public key and validity window, and creating
//! self-signed certificates for servers and tests.

use std::str::FromStr;

use der::asn1::GeneralizedTime;
use der::{Decode, Encode};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::EncodePublicKey;
use sha2::Sha256;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::{Time, Validity};
use x509_cert::Certificate;

use uasc_types::{ByteString, DateTime, Error, StatusCode};

use crate::pkey::{PrivateKey, PublicKey};
use crate::thumbprint::Thumbprint;

/// An X.509 certificate, kept alongside the exact DER bytes it was parsed
/// from so that thumbprints and re-encoding are byte stable.
#[derive(Debug, Clone)]
pub struct X509 {
    der: Vec<u8>,
    certificate: Certificate,
}

impl X509 {
    /// Parse a certificate from DER bytes.
    pub fn from_der(der: &[u8]) -> Result<X509, Error> {
        let certificate = Certificate::from_der(der).map_err(|e| {
            Error::new(
                StatusCode::BadCertificateInvalid,
                format!("Cannot parse certificate: {e}"),
            )
        })?;
        Ok(X509 {
            der: der.to_vec(),
            certificate,
        })
    }

    /// Parse a certificate from a byte string, as carried in a security
    /// header.
    pub fn from_byte_string(value: &ByteString) -> Result<X509, StatusCode> {
        if value.is_null_or_empty() {
            return Err(StatusCode::BadCertificateInvalid);
        }
        X509::from_der(value.as_ref()).map_err(|e| e.status())
    }

    /// The DER bytes as a byte string for use in a security header.
    pub fn as_byte_string(&self) -> ByteString {
        ByteString::from(&self.der[..])
    }

    /// The raw DER bytes.
    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    /// The SHA-1 thumbprint of the DER form.
    pub fn thumbprint(&self) -> Thumbprint {
        Thumbprint::new(&self.der)
    }

    /// The RSA public key of the certificate subject.
    pub fn public_key(&self) -> Result<PublicKey, Error> {
        let spki_der = self
            .certificate
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|e| {
                Error::new(
                    StatusCode::BadCertificateInvalid,
                    format!("Cannot encode subject public key info: {e}"),
                )
            })?;
        PublicKey::from_der(&spki_der)
    }

    /// The start of the certificate's validity window.
    pub fn not_before(&self) -> DateTime {
        DateTime::from(
            self.certificate
                .tbs_certificate
                .validity
                .not_before
                .to_system_time(),
        )
    }

    /// The end of the certificate's validity window.
    pub fn not_after(&self) -> DateTime {
        DateTime::from(
            self.certificate
                .tbs_certificate
                .validity
                .not_after
                .to_system_time(),
        )
    }

    /// Checks that `now` falls inside the validity window.
    pub fn is_time_valid(&self, now: &DateTime) -> StatusCode {
        if *now < self.not_before() || *now >= self.not_after() {
            log::warn!(
                "Certificate is not valid at {}, window is [{}, {})",
                now,
                self.not_before(),
                self.not_after()
            );
            StatusCode::BadCertificateTimeInvalid
        } else {
            StatusCode::Good
        }
    }

    /// Create a self-signed certificate over the supplied key with the given
    /// subject common name and validity window.
    pub fn self_signed(
        key: &PrivateKey,
        common_name: &str,
        not_before: DateTime,
        not_after: DateTime,
    ) -> Result<X509, Error> {
        fn unexpected(e: impl std::fmt::Display) -> Error {
            Error::new(
                StatusCode::BadUnexpectedError,
                format!("Cannot create certificate: {e}"),
            )
        }

        fn to_asn1_time(value: &DateTime) -> Result<Time, Error> {
            let system_time: std::time::SystemTime = value.as_chrono().into();
            let date_time = der::DateTime::from_system_time(system_time).map_err(unexpected)?;
            Ok(Time::GeneralTime(GeneralizedTime::from_date_time(
                date_time,
            )))
        }

        let subject = Name::from_str(&format!("CN={}", common_name)).map_err(unexpected)?;
        let serial = SerialNumber::from(OsRng.next_u32());
        let validity = Validity {
            not_before: to_asn1_time(&not_before)?,
            not_after: to_asn1_time(&not_after)?,
        };
        let spki_der = key
            .as_rsa()
            .to_public_key()
            .to_public_key_der()
            .map_err(unexpected)?;
        let spki = SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes()).map_err(unexpected)?;

        let signer = SigningKey::<Sha256>::new(key.as_rsa().clone());
        let builder = CertificateBuilder::new(Profile::Root, serial, validity, subject, spki, &signer)
            .map_err(unexpected)?;
        let certificate = builder
            .build::<rsa::pkcs1v15::Signature>()
            .map_err(unexpected)?;
        let der = certificate.to_der().map_err(unexpected)?;
        Ok(X509 { der, certificate })
    }
}
