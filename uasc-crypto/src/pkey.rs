// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Asymmetric encryption and signing via RSA key pairs.

use rand::rngs::OsRng;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};

use uasc_types::{Error, StatusCode};

/// The padding scheme of an RSA encryption operation. Which one to use is
/// dictated by the security policy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RsaPadding {
    /// PKCS#1 v1.5 padding, 11 bytes of overhead per block.
    Pkcs1,
    /// OAEP padding with SHA-1, 42 bytes of overhead per block.
    OaepSha1,
}

impl RsaPadding {
    fn byte_overhead(&self) -> usize {
        match self {
            RsaPadding::Pkcs1 => 11,
            RsaPadding::OaepSha1 => 42,
        }
    }
}

/// Sizing arithmetic shared by public and private keys.
pub trait KeySize {
    /// The length of the RSA modulus in bits.
    fn bit_length(&self) -> usize;

    /// The length of the RSA modulus in bytes. This is also the size of a
    /// signature and of a single cipher text block.
    fn size(&self) -> usize {
        self.bit_length() / 8
    }

    /// The number of plain text bytes that fit into one encrypted block
    /// under the given padding.
    fn plain_text_block_size(&self, padding: RsaPadding) -> usize {
        self.size() - padding.byte_overhead()
    }

    /// The size of the cipher text produced by encrypting `data_size` bytes
    /// under the given padding.
    fn calculate_cipher_text_size(&self, data_size: usize, padding: RsaPadding) -> usize {
        let plain_text_block_size = self.plain_text_block_size(padding);
        let block_count = data_size.div_ceil(plain_text_block_size);
        block_count * self.size()
    }
}

/// An RSA private key.
#[derive(Debug, Clone)]
pub struct PrivateKey {
    value: RsaPrivateKey,
}

impl KeySize for PrivateKey {
    fn bit_length(&self) -> usize {
        self.value.size() * 8
    }
}

impl PrivateKey {
    /// Generate a new private key of the given bit length.
    pub fn new(bit_length: usize) -> Result<PrivateKey, Error> {
        let value = RsaPrivateKey::new(&mut OsRng, bit_length).map_err(|e| {
            Error::new(
                StatusCode::BadUnexpectedError,
                format!("Cannot create RSA key: {e}"),
            )
        })?;
        Ok(PrivateKey { value })
    }

    /// Wrap an existing RSA private key.
    pub fn from_rsa(value: RsaPrivateKey) -> PrivateKey {
        PrivateKey { value }
    }

    /// The inner RSA key.
    pub fn as_rsa(&self) -> &RsaPrivateKey {
        &self.value
    }

    /// The public half of this key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            value: self.value.to_public_key(),
        }
    }

    /// Signs the data with RSA-SHA1 / PKCS#1 v1.5 into the `signature`
    /// buffer, which must be exactly one key-size long. Returns the
    /// signature size.
    pub fn sign_sha1(&self, data: &[u8], signature: &mut [u8]) -> Result<usize, Error> {
        let digest = Sha1::digest(data);
        let result = self
            .value
            .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
            .map_err(|e| {
                Error::new(
                    StatusCode::BadSecurityChecksFailed,
                    format!("Signing failed: {e}"),
                )
            })?;
        if signature.len() != result.len() {
            return Err(Error::new(
                StatusCode::BadSecurityChecksFailed,
                format!(
                    "Signature buffer is {} bytes but the signature is {}",
                    signature.len(),
                    result.len()
                ),
            ));
        }
        signature.copy_from_slice(&result);
        Ok(result.len())
    }

    /// Decrypts cipher text block by block into `dst`, returning the number
    /// of plain text bytes produced.
    pub fn private_decrypt(
        &self,
        src: &[u8],
        dst: &mut [u8],
        padding: RsaPadding,
    ) -> Result<usize, Error> {
        let cipher_text_block_size = self.size();
        if src.len() % cipher_text_block_size != 0 {
            return Err(Error::new(
                StatusCode::BadSecurityChecksFailed,
                format!(
                    "Cipher text size {} is not a multiple of the key size {}",
                    src.len(),
                    cipher_text_block_size
                ),
            ));
        }
        let mut src_idx = 0;
        let mut dst_idx = 0;
        while src_idx < src.len() {
            let block = &src[src_idx..(src_idx + cipher_text_block_size)];
            let plain = match padding {
                RsaPadding::Pkcs1 => self.value.decrypt(Pkcs1v15Encrypt, block),
                RsaPadding::OaepSha1 => self.value.decrypt(Oaep::new::<Sha1>(), block),
            }
            .map_err(|e| {
                Error::new(
                    StatusCode::BadSecurityChecksFailed,
                    format!("Decryption failed: {e}"),
                )
            })?;
            dst[dst_idx..(dst_idx + plain.len())].copy_from_slice(&plain);
            src_idx += cipher_text_block_size;
            dst_idx += plain.len();
        }
        Ok(dst_idx)
    }
}

/// An RSA public key.
#[derive(Debug, Clone)]
pub struct PublicKey {
    value: RsaPublicKey,
}

impl KeySize for PublicKey {
    fn bit_length(&self) -> usize {
        self.value.size() * 8
    }
}

impl PublicKey {
    /// Wrap an existing RSA public key.
    pub fn from_rsa(value: RsaPublicKey) -> PublicKey {
        PublicKey { value }
    }

    /// Parse a public key from SubjectPublicKeyInfo DER bytes.
    pub fn from_der(der: &[u8]) -> Result<PublicKey, Error> {
        let value = RsaPublicKey::from_public_key_der(der).map_err(|e| {
            Error::new(
                StatusCode::BadCertificateInvalid,
                format!("Cannot parse public key: {e}"),
            )
        })?;
        Ok(PublicKey { value })
    }

    /// Verifies an RSA-SHA1 / PKCS#1 v1.5 signature over the data. Returns
    /// `false` on mismatch.
    pub fn verify_sha1(&self, data: &[u8], signature: &[u8]) -> Result<bool, Error> {
        let digest = Sha1::digest(data);
        Ok(self
            .value
            .verify(Pkcs1v15Sign::new::<Sha1>(), &digest, signature)
            .is_ok())
    }

    /// Encrypts plain text block by block into `dst`, returning the number
    /// of cipher text bytes produced.
    pub fn public_encrypt(
        &self,
        src: &[u8],
        dst: &mut [u8],
        padding: RsaPadding,
    ) -> Result<usize, Error> {
        let plain_text_block_size = self.plain_text_block_size(padding);
        let cipher_text_block_size = self.size();
        let mut src_idx = 0;
        let mut dst_idx = 0;
        while src_idx < src.len() {
            let block_end = (src_idx + plain_text_block_size).min(src.len());
            let block = &src[src_idx..block_end];
            let cipher = match padding {
                RsaPadding::Pkcs1 => self.value.encrypt(&mut OsRng, Pkcs1v15Encrypt, block),
                RsaPadding::OaepSha1 => {
                    self.value.encrypt(&mut OsRng, Oaep::new::<Sha1>(), block)
                }
            }
            .map_err(|e| {
                Error::new(
                    StatusCode::BadSecurityChecksFailed,
                    format!("Encryption failed: {e}"),
                )
            })?;
            if dst.len() < dst_idx + cipher.len() {
                return Err(Error::new(
                    StatusCode::BadSecurityChecksFailed,
                    "Encryption destination buffer is too small",
                ));
            }
            dst[dst_idx..(dst_idx + cipher.len())].copy_from_slice(&cipher);
            src_idx = block_end;
            dst_idx += cipher_text_block_size;
        }
        Ok(dst_idx)
    }
}
