// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Security policy is the symmetric, asymmetric encryption / decryption +
//! signing / verification algorithms to use and enforce for the session.

use std::fmt;
use std::str::FromStr;

use log::error;

use uasc_types::{ByteString, Error, StatusCode};

use super::{
    aeskey::AesKey,
    hash,
    pkey::{KeySize, PrivateKey, PublicKey, RsaPadding},
    random, SHA1_SIZE,
};

/// Basic128Rsa15 security policy (deprecated in OPC UA 1.04)
///
///   AsymmetricSignatureAlgorithm - RsaSha1
///   AsymmetricEncryptionAlgorithm - Rsa15
///   SymmetricSignatureAlgorithm - HmacSha1
///   SymmetricEncryptionAlgorithm - Aes128-CBC
///   KeyDerivationAlgorithm - PSha1
mod basic_128_rsa_15 {
    pub const SECURITY_POLICY: &str = "Basic128Rsa15";
    pub const SECURITY_POLICY_URI: &str = "http://opcfoundation.org/UA/SecurityPolicy#Basic128Rsa15";

    pub const DERIVED_SIGNATURE_KEY_LENGTH: usize = 16;
    pub const SYMMETRIC_KEY_LENGTH: usize = 16;
    pub const ASYMMETRIC_KEY_LENGTH: (usize, usize) = (1024, 2048);
}

/// Basic256 security policy (deprecated in OPC UA 1.04)
///
///   AsymmetricSignatureAlgorithm - RsaSha1
///   AsymmetricEncryptionAlgorithm - RsaOaep
///   SymmetricSignatureAlgorithm - HmacSha1
///   SymmetricEncryptionAlgorithm - Aes256-CBC
///   KeyDerivationAlgorithm - PSha1
mod basic_256 {
    pub const SECURITY_POLICY: &str = "Basic256";
    pub const SECURITY_POLICY_URI: &str = "http://opcfoundation.org/UA/SecurityPolicy#Basic256";

    pub const DERIVED_SIGNATURE_KEY_LENGTH: usize = 24;
    pub const SYMMETRIC_KEY_LENGTH: usize = 32;
    pub const ASYMMETRIC_KEY_LENGTH: (usize, usize) = (1024, 2048);
}

mod none {
    pub const SECURITY_POLICY: &str = "None";
    pub const SECURITY_POLICY_URI: &str = "http://opcfoundation.org/UA/SecurityPolicy#None";
}

/// The security policies this stack recognises on a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SecurityPolicy {
    /// Policy is unrecognised. Requests carrying such a policy URI are
    /// rejected.
    Unknown,
    /// No security at all.
    None,
    /// RSA PKCS#1 v1.5 + AES-128.
    Basic128Rsa15,
    /// RSA OAEP + AES-256.
    Basic256,
}

impl fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

impl FromStr for SecurityPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            none::SECURITY_POLICY => SecurityPolicy::None,
            basic_128_rsa_15::SECURITY_POLICY => SecurityPolicy::Basic128Rsa15,
            basic_256::SECURITY_POLICY => SecurityPolicy::Basic256,
            _ => {
                error!("Specified security policy \"{}\" is not recognized", s);
                SecurityPolicy::Unknown
            }
        })
    }
}

impl SecurityPolicy {
    /// The URI identifying this policy on the wire.
    pub fn to_uri(&self) -> &'static str {
        match self {
            SecurityPolicy::None => none::SECURITY_POLICY_URI,
            SecurityPolicy::Basic128Rsa15 => basic_128_rsa_15::SECURITY_POLICY_URI,
            SecurityPolicy::Basic256 => basic_256::SECURITY_POLICY_URI,
            SecurityPolicy::Unknown => {
                panic!("Shouldn't be turning an unknown policy into a uri")
            }
        }
    }

    /// The short name of this policy used in configuration files.
    pub fn to_str(&self) -> &'static str {
        match self {
            SecurityPolicy::None => none::SECURITY_POLICY,
            SecurityPolicy::Basic128Rsa15 => basic_128_rsa_15::SECURITY_POLICY,
            SecurityPolicy::Basic256 => basic_256::SECURITY_POLICY,
            SecurityPolicy::Unknown => "",
        }
    }

    /// Maps a policy URI to a policy. Anything outside the recognised set is
    /// `Unknown`.
    pub fn from_uri(uri: &str) -> SecurityPolicy {
        match uri {
            none::SECURITY_POLICY_URI => SecurityPolicy::None,
            basic_128_rsa_15::SECURITY_POLICY_URI => SecurityPolicy::Basic128Rsa15,
            basic_256::SECURITY_POLICY_URI => SecurityPolicy::Basic256,
            _ => {
                error!(
                    "Specified security policy uri \"{}\" is not recognized",
                    uri
                );
                SecurityPolicy::Unknown
            }
        }
    }

    /// `true` for policies that carry actual cryptography.
    pub fn is_supported(&self) -> bool {
        matches!(
            self,
            SecurityPolicy::None | SecurityPolicy::Basic128Rsa15 | SecurityPolicy::Basic256
        )
    }

    /// Length in bytes of a secure channel nonce, which equals the symmetric
    /// key length of the policy.
    pub fn secure_channel_nonce_length(&self) -> usize {
        match self {
            SecurityPolicy::Basic128Rsa15 => basic_128_rsa_15::SYMMETRIC_KEY_LENGTH,
            SecurityPolicy::Basic256 => basic_256::SYMMETRIC_KEY_LENGTH,
            _ => 0,
        }
    }

    /// Length in bytes of the derived symmetric signing key.
    pub fn derived_signature_key_size(&self) -> usize {
        match self {
            SecurityPolicy::Basic128Rsa15 => basic_128_rsa_15::DERIVED_SIGNATURE_KEY_LENGTH,
            SecurityPolicy::Basic256 => basic_256::DERIVED_SIGNATURE_KEY_LENGTH,
            _ => 0,
        }
    }

    /// Plain text block size for symmetric encryption.
    pub fn plain_block_size(&self) -> usize {
        match self {
            SecurityPolicy::Basic128Rsa15 | SecurityPolicy::Basic256 => 16,
            _ => 0,
        }
    }

    /// Size in bytes of a symmetric signature.
    pub fn symmetric_signature_size(&self) -> usize {
        match self {
            SecurityPolicy::Basic128Rsa15 | SecurityPolicy::Basic256 => SHA1_SIZE,
            _ => 0,
        }
    }

    /// The valid range of RSA key lengths for this policy.
    pub fn min_max_asymmetric_keylength(&self) -> (usize, usize) {
        match self {
            SecurityPolicy::Basic128Rsa15 => basic_128_rsa_15::ASYMMETRIC_KEY_LENGTH,
            SecurityPolicy::Basic256 => basic_256::ASYMMETRIC_KEY_LENGTH,
            _ => (0, 0),
        }
    }

    /// Tests if the supplied RSA key length in bits is valid for this policy.
    pub fn is_valid_keylength(&self, keylength: usize) -> bool {
        let (min, max) = self.min_max_asymmetric_keylength();
        keylength >= min && keylength <= max
    }

    /// The RSA padding scheme the policy uses for asymmetric encryption.
    pub fn asymmetric_encryption_padding(&self) -> RsaPadding {
        match self {
            SecurityPolicy::Basic128Rsa15 => RsaPadding::Pkcs1,
            SecurityPolicy::Basic256 => RsaPadding::OaepSha1,
            _ => panic!("Security policy does not have padding"),
        }
    }

    /// A random nonce of the length this policy requires.
    pub fn random_nonce(&self) -> ByteString {
        match self {
            SecurityPolicy::None => ByteString::null(),
            _ => random::byte_string(self.secure_channel_nonce_length()),
        }
    }

    /// Pseudo random function used as the key derivation algorithm. Creates
    /// pseudo random bytes from the secret and seed.
    fn prf(&self, secret: &[u8], seed: &[u8], length: usize, offset: usize) -> Vec<u8> {
        // Both supported policies derive with P_SHA1
        let result = hash::p_sha1(secret, seed, offset + length);
        result[offset..(offset + length)].to_vec()
    }

    /// Part 6
    /// 6.7.5
    /// Deriving keys. Once the SecureChannel is established the Messages are
    /// signed and encrypted with keys derived from the Nonces exchanged in
    /// the OpenSecureChannel call.
    ///
    /// The parameters of the pseudo random function are:
    ///
    /// Key | Secret | Seed | Length | Offset
    /// ClientSigningKey | ServerNonce | ClientNonce | SigningKeyLength | 0
    /// ClientEncryptingKey | ServerNonce | ClientNonce | EncryptingKeyLength | SigningKeyLength
    /// ClientInitializationVector | ServerNonce | ClientNonce | EncryptingBlockSize | SigningKeyLength + EncryptingKeyLength
    /// ServerSigningKey | ClientNonce | ServerNonce | SigningKeyLength | 0
    /// ServerEncryptingKey | ClientNonce | ServerNonce | EncryptingKeyLength | SigningKeyLength
    /// ServerInitializationVector | ClientNonce | ServerNonce | EncryptingBlockSize | SigningKeyLength + EncryptingKeyLength
    ///
    /// The Client keys are used to secure Messages sent by the Client. The
    /// Server keys are used to secure Messages sent by the Server.
    pub fn make_secure_channel_keys(
        &self,
        secret: &[u8],
        seed: &[u8],
    ) -> (Vec<u8>, AesKey, Vec<u8>) {
        let signing_key_length = self.derived_signature_key_size();
        let (encrypting_key_length, encrypting_block_size) = match self {
            SecurityPolicy::Basic128Rsa15 => (16, 16),
            SecurityPolicy::Basic256 => (32, 16),
            _ => {
                panic!("Invalid policy");
            }
        };

        let signing_key = self.prf(secret, seed, signing_key_length, 0);
        let encrypting_key = self.prf(secret, seed, encrypting_key_length, signing_key_length);
        let encrypting_key = AesKey::new(*self, &encrypting_key);
        let iv = self.prf(
            secret,
            seed,
            encrypting_block_size,
            signing_key_length + encrypting_key_length,
        );

        (signing_key, encrypting_key, iv)
    }

    /// Produce a signature of the data using an asymmetric key. Stores the
    /// signature in the supplied `signature` buffer. Returns the size of the
    /// signature within that buffer.
    pub fn asymmetric_sign(
        &self,
        signing_key: &PrivateKey,
        data: &[u8],
        signature: &mut [u8],
    ) -> Result<usize, Error> {
        match self {
            SecurityPolicy::Basic128Rsa15 | SecurityPolicy::Basic256 => {
                signing_key.sign_sha1(data, signature)
            }
            _ => panic!("Invalid policy"),
        }
    }

    /// Verifies a signature of the data using an asymmetric key.
    pub fn asymmetric_verify_signature(
        &self,
        verification_key: &PublicKey,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), Error> {
        let verified = match self {
            SecurityPolicy::Basic128Rsa15 | SecurityPolicy::Basic256 => {
                verification_key.verify_sha1(data, signature)?
            }
            _ => panic!("Invalid policy"),
        };
        if verified {
            Ok(())
        } else {
            error!("Signature mismatch");
            Err(Error::new(
                StatusCode::BadSecurityChecksFailed,
                "Signature verification failed",
            ))
        }
    }

    /// Encrypts a message using the supplied encryption key, returns the
    /// cipher text size.
    pub fn asymmetric_encrypt(
        &self,
        encryption_key: &PublicKey,
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<usize, Error> {
        encryption_key.public_encrypt(src, dst, self.asymmetric_encryption_padding())
    }

    /// Decrypts a message whose thumbprint matches the x509 cert and private
    /// key pair. Returns the plain text size.
    pub fn asymmetric_decrypt(
        &self,
        decryption_key: &PrivateKey,
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<usize, Error> {
        decryption_key.private_decrypt(src, dst, self.asymmetric_encryption_padding())
    }

    /// Produce a signature of the data using the derived symmetric signing
    /// key. Stores the signature in the supplied `signature` buffer.
    /// Returns the signature size.
    pub fn symmetric_sign(
        &self,
        key: &[u8],
        data: &[u8],
        signature: &mut [u8],
    ) -> Result<usize, Error> {
        hash::hmac_sha1(key, data, signature)?;
        Ok(self.symmetric_signature_size())
    }

    /// Verify the signature of data using the derived symmetric signing key.
    pub fn symmetric_verify_signature(
        &self,
        key: &[u8],
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), Error> {
        if hash::verify_hmac_sha1(key, data, signature) {
            Ok(())
        } else {
            error!("Symmetric signature verification failed");
            Err(Error::new(
                StatusCode::BadSecurityChecksFailed,
                "Symmetric signature verification failed",
            ))
        }
    }

    /// Encrypt data using the derived symmetric encryption key and IV.
    pub fn symmetric_encrypt(
        &self,
        key: &AesKey,
        iv: &[u8],
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<usize, Error> {
        key.encrypt(src, iv, dst)
    }

    /// Decrypt data using the derived symmetric encryption key and IV.
    pub fn symmetric_decrypt(
        &self,
        key: &AesKey,
        iv: &[u8],
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<usize, Error> {
        key.decrypt(src, iv, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_mapping() {
        assert_eq!(
            SecurityPolicy::from_uri("http://opcfoundation.org/UA/SecurityPolicy#None"),
            SecurityPolicy::None
        );
        assert_eq!(
            SecurityPolicy::from_uri("http://opcfoundation.org/UA/SecurityPolicy#Basic128Rsa15"),
            SecurityPolicy::Basic128Rsa15
        );
        assert_eq!(
            SecurityPolicy::from_uri("http://opcfoundation.org/UA/SecurityPolicy#Basic256"),
            SecurityPolicy::Basic256
        );
        // Policies outside the recognised set are unknown, even valid OPC-UA ones
        assert_eq!(
            SecurityPolicy::from_uri(
                "http://opcfoundation.org/UA/SecurityPolicy#Aes256_Sha256_RsaPss"
            ),
            SecurityPolicy::Unknown
        );
        assert_eq!(SecurityPolicy::from_str("Basic256").unwrap(), SecurityPolicy::Basic256);
        assert_eq!(SecurityPolicy::from_str("nonsense").unwrap(), SecurityPolicy::Unknown);
    }

    #[test]
    fn nonce_lengths() {
        assert_eq!(SecurityPolicy::None.secure_channel_nonce_length(), 0);
        assert_eq!(
            SecurityPolicy::Basic128Rsa15.secure_channel_nonce_length(),
            16
        );
        assert_eq!(SecurityPolicy::Basic256.secure_channel_nonce_length(), 32);
        assert_eq!(SecurityPolicy::Basic256.random_nonce().len(), 32);
        assert!(SecurityPolicy::None.random_nonce().is_null());
    }

    #[test]
    fn derived_key_sizes() {
        for (policy, sig_len, enc_len) in [
            (SecurityPolicy::Basic128Rsa15, 16, 16),
            (SecurityPolicy::Basic256, 24, 32),
        ] {
            let nonce_len = policy.secure_channel_nonce_length();
            let secret = vec![1u8; nonce_len];
            let seed = vec![2u8; nonce_len];
            let (signing_key, encrypting_key, iv) =
                policy.make_secure_channel_keys(&secret, &seed);
            assert_eq!(signing_key.len(), sig_len);
            assert_eq!(encrypting_key.value().len(), enc_len);
            assert_eq!(iv.len(), 16);
        }
    }

    #[test]
    fn derivation_is_directional() {
        let policy = SecurityPolicy::Basic128Rsa15;
        let client_nonce = vec![1u8; 16];
        let server_nonce = vec![2u8; 16];
        // The same inputs produce the same keys on both sides of the channel
        let (client_keys_a, ..) = policy.make_secure_channel_keys(&server_nonce, &client_nonce);
        let (client_keys_b, ..) = policy.make_secure_channel_keys(&server_nonce, &client_nonce);
        assert_eq!(client_keys_a, client_keys_b);
        // Swapping secret and seed yields the other direction's keys
        let (server_keys, ..) = policy.make_secure_channel_keys(&client_nonce, &server_nonce);
        assert_ne!(client_keys_a, server_keys);
    }

    #[test]
    fn symmetric_sign_verify() {
        let policy = SecurityPolicy::Basic256;
        let key = vec![5u8; policy.derived_signature_key_size()];
        let data = b"data to protect";
        let mut signature = vec![0u8; policy.symmetric_signature_size()];
        policy.symmetric_sign(&key, data, &mut signature).unwrap();
        policy
            .symmetric_verify_signature(&key, data, &signature)
            .unwrap();
        assert!(policy
            .symmetric_verify_signature(&key, b"other data", &signature)
            .is_err());
    }
}
