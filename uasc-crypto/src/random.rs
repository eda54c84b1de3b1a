// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Cryptographically secure random data, used for nonces.

use rand::rngs::OsRng;
use rand::RngCore;

use uasc_types::ByteString;

/// Fills the slice with random bytes from the OS entropy source.
pub fn bytes(bytes: &mut [u8]) {
    OsRng.fill_bytes(bytes);
}

/// Creates a random byte string of the given length.
pub fn byte_string(length: usize) -> ByteString {
    let mut value = vec![0u8; length];
    bytes(&mut value);
    ByteString::from(value)
}
