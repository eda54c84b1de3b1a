// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The comms module holds the functionality related to sending and receiving
//! messages over a secure channel: framing, chunking, security headers and
//! the channel cryptography itself.

pub mod buffer;
pub mod channel_security;
pub mod chunker;
pub mod message_chunk;
pub mod security_header;
pub mod tcp_codec;
pub mod tcp_types;
