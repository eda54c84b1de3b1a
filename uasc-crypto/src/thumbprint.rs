// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Contains the implementation of `Thumbprint`.

use sha1::{Digest, Sha1};

use uasc_types::ByteString;

/// The SHA-1 digest of a DER encoded certificate. Used by the asymmetric
/// security header to identify the receiver's certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbprint {
    value: [u8; Thumbprint::THUMBPRINT_SIZE],
}

impl Thumbprint {
    /// Size in bytes of a certificate thumbprint.
    pub const THUMBPRINT_SIZE: usize = 20;

    /// Computes the thumbprint of the supplied DER bytes.
    pub fn new(der: &[u8]) -> Thumbprint {
        let digest = Sha1::digest(der);
        let mut value = [0u8; Self::THUMBPRINT_SIZE];
        value.copy_from_slice(&digest);
        Thumbprint { value }
    }

    /// The raw digest bytes.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// The digest as a byte string for use in a security header.
    pub fn as_byte_string(&self) -> ByteString {
        ByteString::from(&self.value[..])
    }

    /// The digest as a lowercase hex string. Thumbprint comparison is
    /// byte-exact in this form.
    pub fn as_hex_string(&self) -> String {
        let mut hex = String::with_capacity(self.value.len() * 2);
        for b in &self.value {
            hex.push_str(&format!("{:02x}", b));
        }
        hex
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        // SHA-1("abc")
        let thumbprint = Thumbprint::new(b"abc");
        assert_eq!(
            thumbprint.as_hex_string(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(thumbprint.value().len(), Thumbprint::THUMBPRINT_SIZE);
        assert_eq!(thumbprint.as_byte_string().len(), 20);
    }
}
