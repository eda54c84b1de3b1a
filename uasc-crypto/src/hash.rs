// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Hashing and message authentication functions: the P_SHA1 pseudo random
//! function used for key derivation and HMAC-SHA1 for symmetric signatures.

use hmac::{Hmac, Mac};
use sha1::Sha1;

use uasc_types::{Error, StatusCode};

use crate::SHA1_SIZE;

type HmacSha1 = Hmac<Sha1>;

fn hmac_sha1_digest(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC key of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// The P_SHA1 pseudo random function from TLS / WS-SecureConversation.
///
/// ```text
/// P_SHA1(secret, seed) = HMAC_SHA1(secret, A(1) + seed) +
///                        HMAC_SHA1(secret, A(2) + seed) + ...
/// A(0) = seed, A(n) = HMAC_SHA1(secret, A(n-1))
/// ```
///
/// Returns `length` bytes of output.
pub fn p_sha1(secret: &[u8], seed: &[u8], length: usize) -> Vec<u8> {
    let mut result = Vec::with_capacity(length + SHA1_SIZE);
    let mut a = hmac_sha1_digest(secret, seed);
    while result.len() < length {
        let mut input = a.clone();
        input.extend_from_slice(seed);
        result.extend_from_slice(&hmac_sha1_digest(secret, &input));
        a = hmac_sha1_digest(secret, &a);
    }
    result.truncate(length);
    result
}

/// Signs `data` with HMAC-SHA1 into the supplied `signature` buffer which
/// must be exactly one digest long.
pub fn hmac_sha1(key: &[u8], data: &[u8], signature: &mut [u8]) -> Result<(), Error> {
    if signature.len() != SHA1_SIZE {
        return Err(Error::new(
            StatusCode::BadSecurityChecksFailed,
            format!(
                "Signature buffer is {} bytes, expected {}",
                signature.len(),
                SHA1_SIZE
            ),
        ));
    }
    signature.copy_from_slice(&hmac_sha1_digest(key, data));
    Ok(())
}

/// Verifies an HMAC-SHA1 signature over `data`.
pub fn verify_hmac_sha1(key: &[u8], data: &[u8], signature: &[u8]) -> bool {
    let mut mac = match HmacSha1::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(data);
    mac.verify_slice(signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p_sha1_is_deterministic_and_sized() {
        let secret = b"server nonce....";
        let seed = b"client nonce....";
        for length in [1usize, 16, 20, 24, 52, 100] {
            let a = p_sha1(secret, seed, length);
            let b = p_sha1(secret, seed, length);
            assert_eq!(a.len(), length);
            assert_eq!(a, b);
        }
        // A longer request is a prefix-extension of a shorter one
        let short = p_sha1(secret, seed, 16);
        let long = p_sha1(secret, seed, 52);
        assert_eq!(&long[..16], &short[..]);
        // Swapping secret and seed produces different output
        assert_ne!(p_sha1(secret, seed, 20), p_sha1(seed, secret, 20));
    }

    #[test]
    fn hmac_round_trip() {
        let key = [7u8; 24];
        let data = b"some payload to sign";
        let mut signature = [0u8; SHA1_SIZE];
        hmac_sha1(&key, data, &mut signature).unwrap();
        assert!(verify_hmac_sha1(&key, data, &signature));
        assert!(!verify_hmac_sha1(&key, b"tampered payload", &signature));
        assert!(!verify_hmac_sha1(&[8u8; 24], data, &signature));
    }
}
