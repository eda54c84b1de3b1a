// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Symmetric encryption / decryption wrapper.

use std::result::Result;

use aes::cipher::{
    block_padding::NoPadding, generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut,
    KeyIvInit,
};
use zeroize::Zeroize;

use uasc_types::{Error, StatusCode};

use super::SecurityPolicy;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const AES_BLOCK_SIZE: usize = 16;
const AES128_KEY_SIZE: usize = 16;
const AES256_KEY_SIZE: usize = 32;

type AesArray128 = GenericArray<u8, <aes::Aes128 as aes::cipher::BlockSizeUser>::BlockSize>;
type AesArray256 = GenericArray<u8, <aes::Aes256 as aes::cipher::KeySizeUser>::KeySize>;

type EncryptResult = Result<usize, Error>;

#[derive(Debug)]
/// Wrapper around an AES key. The raw key material is wiped on drop.
pub struct AesKey {
    value: Vec<u8>,
    security_policy: SecurityPolicy,
}

impl Drop for AesKey {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}

impl AesKey {
    /// Create a new AES key with the given security policy and raw value.
    pub fn new(security_policy: SecurityPolicy, value: &[u8]) -> AesKey {
        AesKey {
            value: value.to_vec(),
            security_policy,
        }
    }

    /// Get the raw value of this AES key.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    fn validate_aes_args(&self, src: &[u8], iv: &[u8], dst: &mut [u8]) -> Result<(), Error> {
        if dst.len() < src.len() + self.block_size() {
            Err(Error::new(
                StatusCode::BadUnexpectedError,
                format!(
                    "Dst buffer is too small {} vs {} + {}",
                    src.len(),
                    dst.len(),
                    self.block_size()
                ),
            ))
        } else if iv.len() != self.iv_length() {
            Err(Error::new(
                StatusCode::BadUnexpectedError,
                format!("IV is not an expected size, len = {}", iv.len()),
            ))
        } else if src.len() % self.block_size() != 0 {
            Err(Error::new(
                StatusCode::BadUnexpectedError,
                format!("Block size {} is wrong, check stack", src.len()),
            ))
        } else {
            Ok(())
        }
    }

    fn encrypt_aes128_cbc(&self, src: &[u8], iv: &[u8], dst: &mut [u8]) -> EncryptResult {
        self.validate_aes_args(src, iv, dst)?;
        Aes128CbcEnc::new(
            AesArray128::from_slice(&self.value),
            AesArray128::from_slice(iv),
        )
        .encrypt_padded_b2b_mut::<NoPadding>(src, dst)
        .map_err(|e| Error::new(StatusCode::BadUnexpectedError, e.to_string()))?;
        Ok(src.len())
    }

    fn encrypt_aes256_cbc(&self, src: &[u8], iv: &[u8], dst: &mut [u8]) -> EncryptResult {
        self.validate_aes_args(src, iv, dst)?;
        Aes256CbcEnc::new(
            AesArray256::from_slice(&self.value),
            AesArray128::from_slice(iv),
        )
        .encrypt_padded_b2b_mut::<NoPadding>(src, dst)
        .map_err(|e| Error::new(StatusCode::BadUnexpectedError, e.to_string()))?;
        Ok(src.len())
    }

    fn decrypt_aes128_cbc(&self, src: &[u8], iv: &[u8], dst: &mut [u8]) -> EncryptResult {
        self.validate_aes_args(src, iv, dst)?;
        Aes128CbcDec::new(
            AesArray128::from_slice(&self.value),
            AesArray128::from_slice(iv),
        )
        .decrypt_padded_b2b_mut::<NoPadding>(src, dst)
        .map_err(|e| Error::new(StatusCode::BadUnexpectedError, e.to_string()))?;
        Ok(src.len())
    }

    fn decrypt_aes256_cbc(&self, src: &[u8], iv: &[u8], dst: &mut [u8]) -> EncryptResult {
        self.validate_aes_args(src, iv, dst)?;
        Aes256CbcDec::new(
            AesArray256::from_slice(&self.value),
            AesArray128::from_slice(iv),
        )
        .decrypt_padded_b2b_mut::<NoPadding>(src, dst)
        .map_err(|e| Error::new(StatusCode::BadUnexpectedError, e.to_string()))?;
        Ok(src.len())
    }

    /// Get the block size of the associated security policy for this key.
    pub fn block_size(&self) -> usize {
        match self.security_policy {
            SecurityPolicy::Basic128Rsa15 | SecurityPolicy::Basic256 => AES_BLOCK_SIZE,
            _ => 0,
        }
    }

    /// Get the IV length of the associated security policy for this key.
    pub fn iv_length(&self) -> usize {
        match self.security_policy {
            SecurityPolicy::Basic128Rsa15 | SecurityPolicy::Basic256 => AES_BLOCK_SIZE,
            _ => 0,
        }
    }

    /// Get the AES key length.
    pub fn key_length(&self) -> usize {
        match self.security_policy {
            SecurityPolicy::Basic128Rsa15 => AES128_KEY_SIZE,
            SecurityPolicy::Basic256 => AES256_KEY_SIZE,
            _ => 0,
        }
    }

    /// Encrypt data in `src` into `dst`.
    pub fn encrypt(&self, src: &[u8], iv: &[u8], dst: &mut [u8]) -> EncryptResult {
        match self.security_policy {
            SecurityPolicy::Basic128Rsa15 => self.encrypt_aes128_cbc(src, iv, dst),
            SecurityPolicy::Basic256 => self.encrypt_aes256_cbc(src, iv, dst),
            _ => Err(Error::new(
                StatusCode::BadUnexpectedError,
                "Unsupported security policy",
            )),
        }
    }

    /// Decrypts data using AES. The initialization vector is derived with
    /// the other keys for the secure channel.
    pub fn decrypt(&self, src: &[u8], iv: &[u8], dst: &mut [u8]) -> EncryptResult {
        match self.security_policy {
            SecurityPolicy::Basic128Rsa15 => self.decrypt_aes128_cbc(src, iv, dst),
            SecurityPolicy::Basic256 => self.decrypt_aes256_cbc(src, iv, dst),
            _ => Err(Error::new(
                StatusCode::BadUnexpectedError,
                "Unsupported security policy",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        for (policy, key_len) in [
            (SecurityPolicy::Basic128Rsa15, AES128_KEY_SIZE),
            (SecurityPolicy::Basic256, AES256_KEY_SIZE),
        ] {
            let key = AesKey::new(policy, &vec![3u8; key_len]);
            let iv = vec![9u8; AES_BLOCK_SIZE];
            let plain = vec![0x5Au8; 64];
            let mut cipher = vec![0u8; plain.len() + AES_BLOCK_SIZE];
            let size = key.encrypt(&plain, &iv, &mut cipher).unwrap();
            assert_eq!(size, plain.len());
            assert_ne!(&cipher[..size], &plain[..]);

            let mut decrypted = vec![0u8; size + AES_BLOCK_SIZE];
            let size = key.decrypt(&cipher[..size], &iv, &mut decrypted).unwrap();
            assert_eq!(&decrypted[..size], &plain[..]);
        }
    }

    #[test]
    fn rejects_unaligned_input() {
        let key = AesKey::new(SecurityPolicy::Basic128Rsa15, &[1u8; AES128_KEY_SIZE]);
        let iv = [0u8; AES_BLOCK_SIZE];
        let plain = [0u8; 30];
        let mut cipher = [0u8; 64];
        assert!(key.encrypt(&plain, &iv, &mut cipher).is_err());
    }
}
