// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

#![warn(missing_docs)]

//! The UASC core module holds the secure channel machinery shared by
//! anything speaking the protocol: message chunking, security headers,
//! channel cryptography, the opc.tcp framing types and the standard
//! handshake messages.

pub mod comms;
pub mod handle;

pub mod messages;
pub use messages::{Message, MessageType, RequestMessage, ResponseMessage};
