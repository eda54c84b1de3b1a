// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! [ChannelSecurity] is the security state of one secure channel and the
//! code that applies it to chunks: asymmetric signing and encryption for
//! open secure channel traffic, symmetric for everything after.
//!
//! The state is shaped around the server's view of a channel. "Own" material
//! is the certificate and key this endpoint presents, "peer" material is
//! what the other side supplied in its open request; inbound keys verify
//! and decrypt what the peer sends, outbound keys secure what we send.

use std::collections::HashMap;
use std::io::Cursor;

use chrono::Duration;
use log::warn;
use zeroize::Zeroize;

use uasc_crypto::{
    aeskey::AesKey,
    pkey::{KeySize, PrivateKey},
    random, SecurityPolicy, X509,
};
use uasc_types::{
    ByteString, ChannelSecurityToken, DateTime, DecodingOptions, EncodingResult, Error,
    MessageSecurityMode, SimpleBinaryDecodable, SimpleBinaryEncodable, StatusCode,
};

use super::message_chunk::{
    MessageChunk, MessageChunkHeader, MessageChunkType, MESSAGE_CHUNK_HEADER_SIZE,
    MESSAGE_SIZE_OFFSET,
};
use super::security_header::{
    AsymmetricSecurityHeader, SecurityHeader, SymmetricSecurityHeader,
};
use super::tcp_types::MIN_CHUNK_SIZE;

/// Extra share of a token's lifetime during which its keys are still honoured
/// on the inbound path, mirroring the expiry watchdog.
const LIFETIME_GRACE_PERCENT: i64 = 20;

/// RSA keys over 2048 bits declare their padding with two size bytes.
const SINGLE_BYTE_PADDING_MAX_KEY_SIZE: usize = 256;

/// Sequence header bytes preceding the chunk body.
const SEQUENCE_HEADER_SIZE: usize = 8;

/// The derived symmetric keys for one direction of a channel. Wiped on drop,
/// which covers renewal replacement as well as channel teardown.
#[derive(Debug)]
struct KeySet {
    signing_key: Vec<u8>,
    encryption_key: AesKey,
    iv: Vec<u8>,
}

impl KeySet {
    fn derive(policy: SecurityPolicy, secret: &[u8], seed: &[u8]) -> KeySet {
        let (signing_key, encryption_key, iv) = policy.make_secure_channel_keys(secret, seed);
        KeySet {
            signing_key,
            encryption_key,
            iv,
        }
    }
}

impl Drop for KeySet {
    fn drop(&mut self) {
        // The AES key wipes itself
        self.signing_key.zeroize();
        self.iv.zeroize();
    }
}

#[derive(Debug)]
struct InboundKeys {
    keys: KeySet,
    valid_until: DateTime,
}

/// Padding appended to the plaintext of an encrypted chunk so it fills whole
/// cipher blocks. The trailing size byte(s) count as padding themselves.
struct ChunkPadding {
    total: usize,
    two_byte: bool,
}

impl ChunkPadding {
    fn none() -> ChunkPadding {
        ChunkPadding {
            total: 0,
            two_byte: false,
        }
    }

    /// Padding for `unpadded` bytes of sequence header, body and signature.
    fn for_blocks(plain_block_size: usize, two_byte: bool, unpadded: usize) -> ChunkPadding {
        let size_bytes = if two_byte { 2 } else { 1 };
        let fill =
            (plain_block_size - (unpadded + size_bytes) % plain_block_size) % plain_block_size;
        ChunkPadding {
            total: size_bytes + fill,
            two_byte,
        }
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        if self.total == 0 {
            return;
        }
        if self.two_byte {
            let declared = self.total - 2;
            buf.extend(std::iter::repeat((declared & 0xff) as u8).take(self.total - 1));
            buf.push((declared >> 8) as u8);
        } else {
            buf.extend(std::iter::repeat((self.total - 1) as u8).take(self.total));
        }
    }
}

/// Checks the padding at the tail of `data` and returns where it starts.
/// Every filler byte must repeat the declared size, so garbage that survived
/// decryption fails here even when the signature check was somehow passed.
fn strip_padding(data: &[u8], two_byte: bool) -> Result<usize, Error> {
    let failed = || {
        Error::new(
            StatusCode::BadSecurityChecksFailed,
            "Chunk padding is malformed",
        )
    };
    let end = data.len();
    if two_byte {
        if end < 2 {
            return Err(failed());
        }
        let low = data[end - 2];
        let high = data[end - 1];
        let declared = ((high as usize) << 8) | low as usize;
        let start = end.checked_sub(declared + 2).ok_or_else(failed)?;
        if data[start..end - 1].iter().any(|b| *b != low) {
            return Err(failed());
        }
        Ok(start)
    } else {
        if end < 1 {
            return Err(failed());
        }
        let declared = data[end - 1] as usize;
        let start = end.checked_sub(declared + 1).ok_or_else(failed)?;
        if data[start..end].iter().any(|b| *b != data[end - 1]) {
            return Err(failed());
        }
        Ok(start)
    }
}

/// Rewrites the message size field of an encoded chunk in place.
fn write_message_size(data: &mut [u8], message_size: usize) {
    data[MESSAGE_SIZE_OFFSET..MESSAGE_SIZE_OFFSET + 4]
        .copy_from_slice(&(message_size as u32).to_le_bytes());
}

/// Security state of one secure channel.
#[derive(Debug)]
pub struct ChannelSecurity {
    /// The security policy negotiated on the channel.
    security_policy: SecurityPolicy,
    /// The security mode negotiated on the channel. `Invalid` until the
    /// first open request adopts one.
    security_mode: MessageSecurityMode,
    /// Channel id assigned by the server.
    secure_channel_id: u32,
    /// Id of the active token.
    token_id: u32,
    /// When the active token was created.
    token_created_at: DateTime,
    /// Lifetime in milliseconds granted to the active token.
    token_lifetime: u32,
    /// Certificate presented in our outgoing asymmetric headers.
    own_certificate: Option<X509>,
    /// Private key paired with the certificate. Decrypts inbound open
    /// chunks and signs outbound ones.
    own_private_key: Option<PrivateKey>,
    /// The peer's certificate. Encrypts outbound open chunks.
    peer_certificate: Option<X509>,
    /// The nonce this endpoint contributed to key derivation.
    own_nonce: Vec<u8>,
    /// The nonce the peer contributed.
    peer_nonce: Vec<u8>,
    /// Key sets for chunks the peer sends, by token id. A superseded token's
    /// keys stay here for the grace window so messages in flight across a
    /// renewal keep verifying.
    inbound_keys: HashMap<u32, InboundKeys>,
    /// Keys for chunks we send, always the newest token's.
    outbound_keys: Option<KeySet>,
    /// Decoding options applied when parsing chunk headers.
    decoding_options: DecodingOptions,
}

impl ChannelSecurity {
    /// A channel with no negotiated security yet.
    pub fn new(decoding_options: DecodingOptions) -> ChannelSecurity {
        ChannelSecurity {
            security_policy: SecurityPolicy::None,
            security_mode: MessageSecurityMode::Invalid,
            secure_channel_id: 0,
            token_id: 0,
            token_created_at: DateTime::now(),
            token_lifetime: 0,
            own_certificate: None,
            own_private_key: None,
            peer_certificate: None,
            own_nonce: Vec::new(),
            peer_nonce: Vec::new(),
            inbound_keys: HashMap::new(),
            outbound_keys: None,
            decoding_options,
        }
    }

    /// Get the security policy.
    pub fn security_policy(&self) -> SecurityPolicy {
        self.security_policy
    }

    /// Set the security policy.
    pub fn set_security_policy(&mut self, security_policy: SecurityPolicy) {
        self.security_policy = security_policy;
    }

    /// Get the security mode.
    pub fn security_mode(&self) -> MessageSecurityMode {
        self.security_mode
    }

    /// Set the security mode.
    pub fn set_security_mode(&mut self, security_mode: MessageSecurityMode) {
        self.security_mode = security_mode;
    }

    /// Get the channel id.
    pub fn secure_channel_id(&self) -> u32 {
        self.secure_channel_id
    }

    /// Set the channel id.
    pub fn set_secure_channel_id(&mut self, secure_channel_id: u32) {
        self.secure_channel_id = secure_channel_id;
    }

    /// Get the id of the active token.
    pub fn token_id(&self) -> u32 {
        self.token_id
    }

    /// Adopt a freshly issued or renewed token.
    pub fn set_security_token(&mut self, token: &ChannelSecurityToken) {
        self.secure_channel_id = token.channel_id;
        self.token_id = token.token_id;
        self.token_created_at = token.created_at;
        self.token_lifetime = token.revised_lifetime;
    }

    /// Install this endpoint's certificate.
    pub fn set_own_certificate(&mut self, certificate: Option<X509>) {
        self.own_certificate = certificate;
    }

    /// Install this endpoint's private key.
    pub fn set_own_private_key(&mut self, private_key: Option<PrivateKey>) {
        self.own_private_key = private_key;
    }

    /// Get the peer's certificate.
    pub fn peer_certificate(&self) -> Option<&X509> {
        self.peer_certificate.as_ref()
    }

    /// Install the peer's certificate.
    pub fn set_peer_certificate(&mut self, certificate: Option<X509>) {
        self.peer_certificate = certificate;
    }

    /// Install the peer's certificate from the byte string of a security
    /// header. A zero length certificate counts as absent.
    pub fn set_peer_certificate_from_bytes(
        &mut self,
        certificate: &ByteString,
    ) -> Result<(), StatusCode> {
        self.peer_certificate = if certificate.is_null_or_empty() {
            None
        } else {
            Some(X509::from_byte_string(certificate)?)
        };
        Ok(())
    }

    /// Get the decoding options.
    pub fn decoding_options(&self) -> DecodingOptions {
        self.decoding_options.clone()
    }

    /// Generate a fresh own nonce of the length the policy requires.
    pub fn create_nonce(&mut self) {
        self.own_nonce
            .resize(self.security_policy.secure_channel_nonce_length(), 0);
        random::bytes(&mut self.own_nonce);
    }

    /// Get the own nonce.
    pub fn own_nonce(&self) -> &[u8] {
        &self.own_nonce
    }

    /// Set the own nonce.
    pub fn set_own_nonce(&mut self, nonce: &[u8]) {
        self.own_nonce = nonce.to_vec();
    }

    /// The own nonce as a byte string, null when empty.
    pub fn own_nonce_as_byte_string(&self) -> ByteString {
        if self.own_nonce.is_empty() {
            ByteString::null()
        } else {
            ByteString::from(&self.own_nonce)
        }
    }

    /// Get the peer's nonce.
    pub fn peer_nonce(&self) -> &[u8] {
        &self.peer_nonce
    }

    /// Set the peer's nonce.
    pub fn set_peer_nonce(&mut self, nonce: &[u8]) {
        self.peer_nonce = nonce.to_vec();
    }

    /// Set the peer's nonce from a byte string, enforcing the length the
    /// policy requires.
    pub fn set_peer_nonce_from_byte_string(
        &mut self,
        nonce: &ByteString,
    ) -> Result<(), StatusCode> {
        if self.security_policy == SecurityPolicy::None {
            self.peer_nonce = nonce.as_ref().to_vec();
            return Ok(());
        }
        let expected = self.security_policy.secure_channel_nonce_length();
        if nonce.len() != expected {
            warn!(
                "Peer nonce is {} bytes, policy {} requires {}",
                nonce.len(),
                self.security_policy,
                expected
            );
            return Err(StatusCode::BadNonceInvalid);
        }
        self.peer_nonce = nonce.as_ref().to_vec();
        Ok(())
    }

    /// Derive the symmetric key sets for both directions from the exchanged
    /// nonces, per Part 6 6.7.5: the keys that secure what the peer sends
    /// use our nonce as the secret and theirs as the seed, and the reverse
    /// for what we send. Inbound keys are filed under the active token id;
    /// expired entries are dropped at the same time.
    pub fn derive_keys(&mut self) {
        let inbound = KeySet::derive(self.security_policy, &self.own_nonce, &self.peer_nonce);
        let outbound = KeySet::derive(self.security_policy, &self.peer_nonce, &self.own_nonce);

        let grace = (self.token_lifetime as i64) * (100 + LIFETIME_GRACE_PERCENT) / 100;
        let valid_until = self.token_created_at + Duration::milliseconds(grace);

        let now = DateTime::now();
        self.inbound_keys.retain(|_, k| now < k.valid_until);
        self.inbound_keys
            .insert(self.token_id, InboundKeys { keys: inbound, valid_until });
        self.outbound_keys = Some(outbound);
    }

    /// Called when the peer secures a message with `token_id`. Once the
    /// newest token is in use, its predecessors' keys are dropped: the grace
    /// window only exists for messages in flight across the renewal.
    pub fn retire_superseded_keys(&mut self, token_id: u32) {
        if token_id == self.token_id && self.inbound_keys.len() > 1 {
            self.inbound_keys.retain(|id, _| *id == token_id);
        }
    }

    /// The number of token key sets currently usable on the inbound path.
    pub fn inbound_key_count(&self) -> usize {
        self.inbound_keys.len()
    }

    /// Wipe the nonces and every derived key. Called when the channel
    /// aborts so key material doesn't outlive it in memory.
    pub fn wipe_security_material(&mut self) {
        self.own_nonce.zeroize();
        self.peer_nonce.zeroize();
        self.own_nonce.clear();
        self.peer_nonce.clear();
        // KeySet wipes itself on drop
        self.inbound_keys.clear();
        self.outbound_keys = None;
    }

    fn keys_for_token(&self, token_id: u32) -> Result<&KeySet, Error> {
        // Expired tokens are refused even if no renewal ever happened
        self.inbound_keys
            .get(&token_id)
            .filter(|k| DateTime::now() < k.valid_until)
            .map(|k| &k.keys)
            .ok_or_else(|| {
                Error::new(
                    StatusCode::BadSecureChannelTokenUnknown,
                    format!("Token id {} is unknown or expired", token_id),
                )
            })
    }

    /// `true` when chunks on this channel carry signatures, and possibly
    /// encryption, at all.
    fn is_security_applied(&self) -> bool {
        self.security_policy != SecurityPolicy::None
            && matches!(
                self.security_mode,
                MessageSecurityMode::Sign | MessageSecurityMode::SignAndEncrypt
            )
    }

    /// The security header for an outgoing chunk of the given type:
    /// asymmetric for open secure channel chunks, the active token id for
    /// everything else.
    pub fn security_header_for(&self, message_type: MessageChunkType) -> SecurityHeader {
        if !message_type.is_open_secure_channel() {
            return SecurityHeader::Symmetric(SymmetricSecurityHeader {
                token_id: self.token_id,
            });
        }
        if self.security_policy == SecurityPolicy::None {
            return SecurityHeader::Asymmetric(AsymmetricSecurityHeader::none());
        }
        let receiver_certificate_thumbprint = match &self.peer_certificate {
            Some(peer) => peer.thumbprint().as_byte_string(),
            None => ByteString::null(),
        };
        // The certificate must be present when the policy is not None, the
        // handshake has verified this before anything is sent
        let own = self
            .own_certificate
            .as_ref()
            .expect("certificate is required to secure a channel");
        SecurityHeader::Asymmetric(AsymmetricSecurityHeader::new(
            self.security_policy,
            own,
            receiver_certificate_thumbprint,
        ))
    }

    /// Signature bytes appended to an outgoing chunk of the given type.
    fn signature_size_for(&self, message_type: MessageChunkType) -> usize {
        if message_type.is_open_secure_channel() {
            if self.security_policy == SecurityPolicy::None {
                0
            } else {
                self.own_private_key.as_ref().map_or(0, |k| k.size())
            }
        } else if self.is_security_applied() {
            self.security_policy.symmetric_signature_size()
        } else {
            0
        }
    }

    /// The cipher block size and padding-size-byte count for an outgoing
    /// chunk of the given type, or `None` when the chunk is not encrypted.
    fn cipher_block_info(&self, message_type: MessageChunkType) -> Option<(usize, bool)> {
        if self.security_policy == SecurityPolicy::None {
            return None;
        }
        if message_type.is_open_secure_channel() {
            // Open chunks are encrypted even under mode Sign
            let peer_key = self.peer_certificate.as_ref()?.public_key().ok()?;
            let padding = self.security_policy.asymmetric_encryption_padding();
            Some((
                peer_key.plain_text_block_size(padding),
                peer_key.size() > SINGLE_BYTE_PADDING_MAX_KEY_SIZE,
            ))
        } else if self.security_mode == MessageSecurityMode::SignAndEncrypt {
            Some((self.security_policy.plain_block_size(), false))
        } else {
            None
        }
    }

    /// The largest chunk body that fits in `max_chunk_size` bytes on the
    /// wire once headers, padding and signature are accounted for.
    pub fn max_chunk_body_size(
        &self,
        message_type: MessageChunkType,
        max_chunk_size: usize,
    ) -> Result<usize, Error> {
        if max_chunk_size < MIN_CHUNK_SIZE {
            return Err(Error::new(
                StatusCode::BadTcpInternalError,
                format!(
                    "Chunk size {} is less than the minimum of {}",
                    max_chunk_size, MIN_CHUNK_SIZE
                ),
            ));
        }
        let header_size = MESSAGE_CHUNK_HEADER_SIZE
            + self.security_header_for(message_type).byte_len()
            + SEQUENCE_HEADER_SIZE;
        let signature_size = self.signature_size_for(message_type);
        let (usable, padding_reserve) = match self.cipher_block_info(message_type) {
            // Encrypted chunks must fill whole blocks, so round the budget
            // down to one and keep room for the padding size byte(s)
            Some((block, two_byte)) => (
                max_chunk_size - max_chunk_size % block,
                if two_byte { 2 } else { 1 },
            ),
            None => (max_chunk_size, 0),
        };
        Ok(usable - header_size - signature_size - padding_reserve)
    }

    /// Secure an outgoing chunk into `dst`, returning the number of bytes
    /// written. The input chunk is plaintext with its headers in place.
    pub fn secure_outgoing_chunk(
        &self,
        chunk: &MessageChunk,
        dst: &mut [u8],
    ) -> EncodingResult<usize> {
        if !self.is_security_applied() {
            let size = chunk.data.len();
            if dst.len() < size {
                return Err(Error::new(
                    StatusCode::BadEncodingLimitsExceeded,
                    "Chunk exceeds the destination buffer",
                ));
            }
            dst[..size].copy_from_slice(&chunk.data);
            return Ok(size);
        }

        let header = chunk.message_header(&self.decoding_options)?;
        let clear_len = chunk.secured_data_offset(&self.decoding_options)?;
        if header.message_type.is_open_secure_channel() {
            self.secure_open_chunk(chunk, clear_len, dst)
        } else {
            self.secure_message_chunk(chunk, clear_len, dst)
        }
    }

    // Sign with the own key, encrypt to the peer's. The message size written
    // to the wire - and covered by the signature - is the final cipher size.
    fn secure_open_chunk(
        &self,
        chunk: &MessageChunk,
        clear_len: usize,
        dst: &mut [u8],
    ) -> EncodingResult<usize> {
        let own_key = self.own_private_key.as_ref().ok_or_else(|| {
            Error::new(
                StatusCode::BadSecurityChecksFailed,
                "Cannot sign a chunk without a private key",
            )
        })?;
        let peer_key = self
            .peer_certificate
            .as_ref()
            .ok_or_else(|| {
                Error::new(
                    StatusCode::BadSecurityChecksFailed,
                    "Cannot encrypt a chunk without the peer certificate",
                )
            })?
            .public_key()?;

        let signature_size = own_key.size();
        let scheme = self.security_policy.asymmetric_encryption_padding();
        let padding = ChunkPadding::for_blocks(
            peer_key.plain_text_block_size(scheme),
            peer_key.size() > SINGLE_BYTE_PADDING_MAX_KEY_SIZE,
            chunk.data.len() - clear_len + signature_size,
        );

        let mut plain = Vec::with_capacity(chunk.data.len() + padding.total + signature_size);
        plain.extend_from_slice(&chunk.data);
        padding.write_to(&mut plain);

        let cipher_size = peer_key
            .calculate_cipher_text_size(plain.len() + signature_size - clear_len, scheme);
        write_message_size(&mut plain, clear_len + cipher_size);

        let mut signature = vec![0u8; signature_size];
        self.security_policy
            .asymmetric_sign(own_key, &plain, &mut signature)?;
        plain.extend_from_slice(&signature);

        // Headers stay clear, everything from the sequence header on is
        // encrypted
        dst[..clear_len].copy_from_slice(&plain[..clear_len]);
        let written = self.security_policy.asymmetric_encrypt(
            &peer_key,
            &plain[clear_len..],
            &mut dst[clear_len..],
        )?;
        debug_assert_eq!(written, cipher_size);
        Ok(clear_len + written)
    }

    // Sign, and under SignAndEncrypt also encrypt, with the outbound keys.
    fn secure_message_chunk(
        &self,
        chunk: &MessageChunk,
        clear_len: usize,
        dst: &mut [u8],
    ) -> EncodingResult<usize> {
        let keys = self.outbound_keys.as_ref().ok_or_else(|| {
            Error::new(
                StatusCode::BadSecureChannelClosed,
                "Channel has no derived outbound keys",
            )
        })?;
        let signature_size = self.security_policy.symmetric_signature_size();
        let encrypting = self.security_mode == MessageSecurityMode::SignAndEncrypt;

        let padding = if encrypting {
            ChunkPadding::for_blocks(
                self.security_policy.plain_block_size(),
                false,
                chunk.data.len() - clear_len + signature_size,
            )
        } else {
            ChunkPadding::none()
        };

        let mut plain = Vec::with_capacity(chunk.data.len() + padding.total + signature_size);
        plain.extend_from_slice(&chunk.data);
        padding.write_to(&mut plain);
        // Symmetric encryption preserves the length, so the final size is
        // known before signing
        let new_len = plain.len() + signature_size;
        write_message_size(&mut plain, new_len);

        let mut signature = vec![0u8; signature_size];
        self.security_policy
            .symmetric_sign(&keys.signing_key, &plain, &mut signature)?;
        plain.extend_from_slice(&signature);

        if encrypting {
            dst[..clear_len].copy_from_slice(&plain[..clear_len]);
            let written = self.security_policy.symmetric_encrypt(
                &keys.encryption_key,
                &keys.iv,
                &plain[clear_len..],
                &mut dst[clear_len..],
            )?;
            Ok(clear_len + written)
        } else {
            dst[..plain.len()].copy_from_slice(&plain);
            Ok(plain.len())
        }
    }

    /// Remove the security from an incoming chunk, verifying signatures and
    /// padding on the way. Returns the plaintext chunk with its message size
    /// rewritten to the stripped length.
    ///
    /// Receiver thumbprint verification deliberately does not happen here:
    /// the handshake checks it after decoding so that a mismatch can still
    /// produce a well formed response.
    pub fn unsecure_incoming_chunk(&mut self, src: &[u8]) -> Result<MessageChunk, Error> {
        let mut stream = Cursor::new(src);
        let header = MessageChunkHeader::decode(&mut stream, &self.decoding_options)?;
        if header.message_size as usize != src.len() {
            return Err(Error::new(
                StatusCode::BadUnexpectedError,
                format!(
                    "Chunk states a size of {} but {} bytes arrived",
                    header.message_size,
                    src.len()
                ),
            ));
        }
        let security_header =
            SecurityHeader::decode(&mut stream, header.message_type, &self.decoding_options)?;
        let clear_len = stream.position() as usize;

        match security_header {
            SecurityHeader::Asymmetric(security_header) => {
                self.unsecure_open_chunk(src, clear_len, &security_header)
            }
            SecurityHeader::Symmetric(security_header) => {
                self.unsecure_message_chunk(src, clear_len, security_header.token_id)
            }
        }
    }

    // Open chunks are always decrypted with the own private key and verified
    // with the sender's certificate, whatever mode ends up negotiated. The
    // policy in the header decides whether there is any security at all.
    fn unsecure_open_chunk(
        &mut self,
        src: &[u8],
        clear_len: usize,
        security_header: &AsymmetricSecurityHeader,
    ) -> Result<MessageChunk, Error> {
        let uri = security_header.security_policy_uri.as_ref();
        let security_policy = if security_header.security_policy_uri.is_null() {
            SecurityPolicy::None
        } else {
            SecurityPolicy::from_uri(uri)
        };
        match security_policy {
            SecurityPolicy::Unknown => {
                return Err(Error::new(
                    StatusCode::BadSecurityPolicyRejected,
                    format!("Security policy \"{}\" is unknown so it has been rejected", uri),
                ));
            }
            SecurityPolicy::None => {
                return Ok(MessageChunk { data: src.to_vec() });
            }
            _ => {}
        }
        self.security_policy = security_policy;

        if security_header.sender_certificate.is_null() {
            return Err(Error::new(
                StatusCode::BadCertificateInvalid,
                "Sender certificate is missing from a secured open request",
            ));
        }
        let sender_certificate =
            X509::from_byte_string(&security_header.sender_certificate).map_err(Error::from)?;
        let verification_key = sender_certificate.public_key()?;
        // Remember which certificate signed the open request; responses are
        // encrypted to it
        self.peer_certificate = Some(sender_certificate);

        let own_key = self.own_private_key.as_ref().ok_or_else(|| {
            Error::new(
                StatusCode::BadSecurityChecksFailed,
                "Cannot decrypt a chunk without a private key",
            )
        })?;

        let mut plain = vec![0u8; src.len()];
        plain[..clear_len].copy_from_slice(&src[..clear_len]);
        let decrypted = self.security_policy.asymmetric_decrypt(
            own_key,
            &src[clear_len..],
            &mut plain[clear_len..],
        )?;
        let total = clear_len + decrypted;

        let signature_size = verification_key.size();
        let signed_len = total.checked_sub(signature_size).ok_or_else(|| {
            Error::new(
                StatusCode::BadSecurityChecksFailed,
                "Chunk is too short to carry its signature",
            )
        })?;
        self.security_policy.asymmetric_verify_signature(
            &verification_key,
            &plain[..signed_len],
            &plain[signed_len..total],
        )?;

        // The sender sized the padding to our key
        let two_byte = own_key.size() > SINGLE_BYTE_PADDING_MAX_KEY_SIZE;
        let body_end = strip_padding(&plain[..signed_len], two_byte)?;
        plain.truncate(body_end);
        write_message_size(&mut plain, body_end);
        Ok(MessageChunk { data: plain })
    }

    fn unsecure_message_chunk(
        &self,
        src: &[u8],
        clear_len: usize,
        token_id: u32,
    ) -> Result<MessageChunk, Error> {
        if !self.is_security_applied() {
            return Ok(MessageChunk { data: src.to_vec() });
        }
        let keys = self.keys_for_token(token_id)?;
        let signature_size = self.security_policy.symmetric_signature_size();
        let encrypting = self.security_mode == MessageSecurityMode::SignAndEncrypt;

        let (mut plain, total) = if encrypting {
            // One block of slack for the decryptor
            let mut plain = vec![0u8; src.len() + 16];
            plain[..clear_len].copy_from_slice(&src[..clear_len]);
            let decrypted = self.security_policy.symmetric_decrypt(
                &keys.encryption_key,
                &keys.iv,
                &src[clear_len..],
                &mut plain[clear_len..],
            )?;
            (plain, clear_len + decrypted)
        } else {
            (src.to_vec(), src.len())
        };

        let signed_len = total.checked_sub(signature_size).ok_or_else(|| {
            Error::new(
                StatusCode::BadSecurityChecksFailed,
                "Chunk is too short to carry its signature",
            )
        })?;
        self.security_policy.symmetric_verify_signature(
            &keys.signing_key,
            &plain[..signed_len],
            &plain[signed_len..total],
        )?;

        let body_end = if encrypting {
            strip_padding(&plain[..signed_len], false)?
        } else {
            signed_len
        };
        plain.truncate(body_end);
        write_message_size(&mut plain, body_end);
        Ok(MessageChunk { data: plain })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::message_chunk::MessageIsFinalType;

    fn token(token_id: u32, created_at: DateTime, revised_lifetime: u32) -> ChannelSecurityToken {
        ChannelSecurityToken {
            channel_id: 5,
            token_id,
            created_at,
            revised_lifetime,
        }
    }

    /// Two ends of the same channel: "server" derives inbound keys from the
    /// nonces one way round, "client" the other, so what one secures the
    /// other can unsecure.
    fn secured_pair(policy: SecurityPolicy) -> (ChannelSecurity, ChannelSecurity) {
        let nonce_a = vec![1u8; policy.secure_channel_nonce_length()];
        let nonce_b = vec![2u8; policy.secure_channel_nonce_length()];

        let mut sender = ChannelSecurity::new(DecodingOptions::test());
        sender.set_security_policy(policy);
        sender.set_security_mode(MessageSecurityMode::SignAndEncrypt);
        sender.set_own_nonce(&nonce_a);
        sender.set_peer_nonce(&nonce_b);
        sender.set_security_token(&token(1, DateTime::now(), 60_000));
        sender.derive_keys();

        let mut receiver = ChannelSecurity::new(DecodingOptions::test());
        receiver.set_security_policy(policy);
        receiver.set_security_mode(MessageSecurityMode::SignAndEncrypt);
        receiver.set_own_nonce(&nonce_b);
        receiver.set_peer_nonce(&nonce_a);
        receiver.set_security_token(&token(1, DateTime::now(), 60_000));
        receiver.derive_keys();

        (sender, receiver)
    }

    fn msg_chunk(security: &ChannelSecurity, body: &[u8]) -> MessageChunk {
        MessageChunk::new(
            1,
            1,
            MessageChunkType::Message,
            MessageIsFinalType::Final,
            security,
            body,
        )
        .unwrap()
    }

    #[test]
    fn symmetric_round_trip() {
        for policy in [SecurityPolicy::Basic128Rsa15, SecurityPolicy::Basic256] {
            let (sender, mut receiver) = secured_pair(policy);
            let body = vec![0xA5u8; 250];
            let chunk = msg_chunk(&sender, &body);

            let mut secured = vec![0u8; chunk.data.len() + 256];
            let size = sender.secure_outgoing_chunk(&chunk, &mut secured).unwrap();
            // The wire form differs from the plain form
            assert_ne!(&secured[..chunk.data.len()], &chunk.data[..]);

            let plain = receiver.unsecure_incoming_chunk(&secured[..size]).unwrap();
            let headers = plain.headers(&receiver.decoding_options()).unwrap();
            assert_eq!(&plain.data[headers.body], &body[..]);
        }
    }

    #[test]
    fn sign_only_round_trip() {
        let (mut sender, mut receiver) = secured_pair(SecurityPolicy::Basic128Rsa15);
        sender.set_security_mode(MessageSecurityMode::Sign);
        receiver.set_security_mode(MessageSecurityMode::Sign);

        let body = vec![0x3Cu8; 99];
        let chunk = msg_chunk(&sender, &body);
        let mut secured = vec![0u8; chunk.data.len() + 256];
        let size = sender.secure_outgoing_chunk(&chunk, &mut secured).unwrap();
        // Signed but not encrypted: everything after the rewritten message
        // size field is readable on the wire
        assert_eq!(size, chunk.data.len() + 20);
        assert_eq!(&secured[8..chunk.data.len()], &chunk.data[8..]);

        let plain = receiver.unsecure_incoming_chunk(&secured[..size]).unwrap();
        let headers = plain.headers(&receiver.decoding_options()).unwrap();
        assert_eq!(&plain.data[headers.body], &body[..]);
    }

    #[test]
    fn tampered_chunk_is_rejected() {
        let (sender, mut receiver) = secured_pair(SecurityPolicy::Basic128Rsa15);
        let chunk = msg_chunk(&sender, &[0x11u8; 100]);
        let mut secured = vec![0u8; chunk.data.len() + 256];
        let size = sender.secure_outgoing_chunk(&chunk, &mut secured).unwrap();
        // Flip a bit in the encrypted body
        secured[size - 1] ^= 0x01;
        assert!(receiver.unsecure_incoming_chunk(&secured[..size]).is_err());
    }

    #[test]
    fn unknown_token_is_refused() {
        let (sender, mut receiver) = secured_pair(SecurityPolicy::Basic128Rsa15);
        let chunk = msg_chunk(&sender, &[0x22u8; 64]);
        let mut secured = vec![0u8; chunk.data.len() + 256];
        let size = sender.secure_outgoing_chunk(&chunk, &mut secured).unwrap();

        // The receiver only knows keys for token 2 now
        receiver.set_security_token(&token(2, DateTime::now(), 60_000));
        receiver.inbound_keys.clear();
        receiver.derive_keys();

        let err = receiver
            .unsecure_incoming_chunk(&secured[..size])
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BadSecureChannelTokenUnknown);
    }

    #[test]
    fn previous_token_usable_until_new_token_used() {
        let (sender, mut receiver) = secured_pair(SecurityPolicy::Basic128Rsa15);

        // Renew: the receiver now has keys for tokens 1 and 2
        receiver.set_security_token(&token(2, DateTime::now(), 60_000));
        receiver.derive_keys();
        assert_eq!(receiver.inbound_key_count(), 2);
        assert_eq!(receiver.token_id(), 2);

        // A message in flight, secured with the old token, still verifies
        let chunk = msg_chunk(&sender, &[0x33u8; 80]);
        let mut secured = vec![0u8; chunk.data.len() + 256];
        let size = sender.secure_outgoing_chunk(&chunk, &mut secured).unwrap();
        assert!(receiver.unsecure_incoming_chunk(&secured[..size]).is_ok());

        // Once the peer uses the new token the old keys are dropped
        receiver.retire_superseded_keys(2);
        assert_eq!(receiver.inbound_key_count(), 1);
        let err = receiver
            .unsecure_incoming_chunk(&secured[..size])
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BadSecureChannelTokenUnknown);
    }

    #[test]
    fn expired_keys_are_refused() {
        let (sender, mut receiver) = secured_pair(SecurityPolicy::Basic128Rsa15);
        let chunk = msg_chunk(&sender, &[0x44u8; 48]);
        let mut secured = vec![0u8; chunk.data.len() + 256];
        let size = sender.secure_outgoing_chunk(&chunk, &mut secured).unwrap();

        // Rewind the token creation so that lifetime * 1.2 has elapsed
        receiver.set_security_token(&token(
            1,
            DateTime::now() + Duration::milliseconds(-1300),
            1000,
        ));
        receiver.inbound_keys.clear();
        receiver.derive_keys();

        let err = receiver
            .unsecure_incoming_chunk(&secured[..size])
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BadSecureChannelTokenUnknown);
    }

    #[test]
    fn unsecured_chunks_pass_through() {
        let mut security = ChannelSecurity::new(DecodingOptions::test());
        security.set_security_policy(SecurityPolicy::None);
        security.set_security_mode(MessageSecurityMode::None);
        let chunk = msg_chunk(&security, &[0x55u8; 32]);

        let mut out = vec![0u8; chunk.data.len()];
        let size = security.secure_outgoing_chunk(&chunk, &mut out).unwrap();
        assert_eq!(&out[..size], &chunk.data[..]);

        let plain = security.unsecure_incoming_chunk(&out[..size]).unwrap();
        assert_eq!(plain.data, chunk.data);
    }

    #[test]
    fn unknown_policy_is_rejected() {
        use crate::comms::security_header::SequenceHeader;
        use uasc_types::UAString;

        // Hand-build an OPN chunk naming a policy outside the recognised set
        let security_header = AsymmetricSecurityHeader {
            security_policy_uri: UAString::from(
                "http://opcfoundation.org/UA/SecurityPolicy#Aes256_Sha256_RsaPss",
            ),
            sender_certificate: ByteString::null(),
            receiver_certificate_thumbprint: ByteString::null(),
        };
        let sequence_header = SequenceHeader {
            sequence_number: 1,
            request_id: 1,
        };
        let message_size =
            MESSAGE_CHUNK_HEADER_SIZE + security_header.byte_len() + sequence_header.byte_len();
        let chunk_header = MessageChunkHeader {
            message_type: MessageChunkType::OpenSecureChannel,
            is_final: MessageIsFinalType::Final,
            message_size: message_size as u32,
            secure_channel_id: 0,
        };
        let mut data = Vec::with_capacity(message_size);
        chunk_header.encode(&mut data).unwrap();
        security_header.encode(&mut data).unwrap();
        sequence_header.encode(&mut data).unwrap();

        let mut security = ChannelSecurity::new(DecodingOptions::test());
        let err = security.unsecure_incoming_chunk(&data).unwrap_err();
        assert_eq!(err.status(), StatusCode::BadSecurityPolicyRejected);
    }

    #[test]
    fn peer_nonce_length_is_validated() {
        let mut security = ChannelSecurity::new(DecodingOptions::test());
        security.set_security_policy(SecurityPolicy::Basic128Rsa15);
        assert_eq!(
            security
                .set_peer_nonce_from_byte_string(&ByteString::from(vec![0u8; 8]))
                .unwrap_err(),
            StatusCode::BadNonceInvalid
        );
        assert!(security
            .set_peer_nonce_from_byte_string(&ByteString::from(vec![0u8; 16]))
            .is_ok());
    }

    #[test]
    fn security_material_is_wiped() {
        let (_, mut receiver) = secured_pair(SecurityPolicy::Basic256);
        assert!(!receiver.own_nonce().is_empty());
        assert!(receiver.outbound_keys.is_some());
        receiver.wipe_security_material();
        assert!(receiver.own_nonce().is_empty());
        assert!(receiver.peer_nonce().is_empty());
        assert!(receiver.outbound_keys.is_none());
        assert_eq!(receiver.inbound_key_count(), 0);
    }

    #[test]
    fn create_nonce_matches_policy() {
        let mut security = ChannelSecurity::new(DecodingOptions::test());
        security.set_security_policy(SecurityPolicy::Basic256);
        security.create_nonce();
        assert_eq!(security.own_nonce().len(), 32);
        assert_eq!(security.own_nonce_as_byte_string().len(), 32);
    }

    #[test]
    fn chunk_body_budget() {
        let mut security = ChannelSecurity::new(DecodingOptions::test());
        security.set_security_policy(SecurityPolicy::None);
        security.set_security_mode(MessageSecurityMode::None);
        // Chunk header (12) + token id (4) + sequence header (8)
        assert_eq!(
            security
                .max_chunk_body_size(MessageChunkType::Message, MIN_CHUNK_SIZE)
                .unwrap(),
            MIN_CHUNK_SIZE - 24
        );
        assert!(security
            .max_chunk_body_size(MessageChunkType::Message, 1024)
            .is_err());

        // Encrypted chunks lose block alignment, signature and padding too
        let (sender, _) = secured_pair(SecurityPolicy::Basic128Rsa15);
        let budget = sender
            .max_chunk_body_size(MessageChunkType::Message, MIN_CHUNK_SIZE)
            .unwrap();
        // 8196 rounds down to 8192 blocks, minus 24 header, 20 signature, 1 pad byte
        assert_eq!(budget, 8192 - 24 - 20 - 1);
    }

    #[test]
    fn padding_fills_whole_blocks() {
        for unpadded in [1usize, 15, 16, 17, 250] {
            let padding = ChunkPadding::for_blocks(16, false, unpadded);
            assert_eq!((unpadded + padding.total) % 16, 0);
            let mut buf = Vec::new();
            padding.write_to(&mut buf);
            assert_eq!(buf.len(), padding.total);
            // Every padding byte declares the same size
            assert!(buf.iter().all(|b| *b as usize == padding.total - 1));
            // And strip finds the start again
            let mut data = vec![0xEEu8; unpadded];
            data.extend_from_slice(&buf);
            assert_eq!(strip_padding(&data, false).unwrap(), unpadded);
        }
    }

    #[test]
    fn two_byte_padding_round_trip() {
        let padding = ChunkPadding::for_blocks(470, true, 100);
        let mut data = vec![0xEEu8; 100];
        padding.write_to(&mut data);
        assert_eq!((data.len()) % 470, 0);
        assert_eq!(strip_padding(&data, true).unwrap(), 100);
    }
}
