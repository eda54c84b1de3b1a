// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Contains the traits and functions for binary encoding of OPC-UA types,
//! and the error type the rest of the stack reports failures with.

use std::error::Error as StdError;
use std::fmt::{self, Debug, Display};
use std::io::{Read, Result, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::Duration;
use log::error;

use crate::constants;
use crate::status_code::StatusCode;

/// Result of an encoding or decoding operation.
pub type EncodingResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
/// General OPC-UA error.
///
/// Contains a status code, details about the cause, and where it could be
/// retrieved, the request this error occurred as part of.
pub struct Error {
    status: StatusCode,
    request_id: Option<u32>,
    request_handle: Option<u32>,
    context: Box<dyn StdError + Send + Sync>,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.context)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.context)
    }
}

impl Error {
    /// Create a new error with the specified `status` code and
    /// `context` as a dynamic error source.
    pub fn new(status: StatusCode, context: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self {
            status,
            request_id: None,
            request_handle: None,
            context: context.into(),
        }
    }

    /// Create a new error with status code `BadDecodingError` and
    /// `context` as a dynamic error source.
    pub fn decoding(context: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::new(StatusCode::BadDecodingError, context)
    }

    /// Create a new error with status code `BadEncodingError` and
    /// `context` as a dynamic error source.
    pub fn encoding(context: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::new(StatusCode::BadEncodingError, context)
    }

    /// Add request ID and request handle to this error.
    pub fn with_context(mut self, request_id: Option<u32>, request_handle: Option<u32>) -> Self {
        self.request_id = request_id;
        self.request_handle = request_handle;
        self
    }

    /// Add request ID to this error.
    pub fn with_request_id(mut self, id: u32) -> Self {
        self.request_id = Some(id);
        self
    }

    /// Add request handle to this error.
    pub fn with_request_handle(mut self, handle: u32) -> Self {
        self.request_handle = Some(handle);
        self
    }

    /// Get the inner status code of this error.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the full context of this error, if both fields are present.
    pub fn full_context(&self) -> Option<(u32, u32)> {
        if let (Some(id), Some(handle)) = (self.request_id, self.request_handle) {
            Some((id, handle))
        } else {
            None
        }
    }
}

impl From<Error> for StatusCode {
    fn from(value: Error) -> Self {
        error!("{}", value);
        value.status()
    }
}

impl From<StatusCode> for Error {
    fn from(value: StatusCode) -> Self {
        Error::new(value, value.to_string())
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        value.status().into()
    }
}

#[derive(Clone, Debug)]
/// General decoding options.
pub struct DecodingOptions {
    /// Time offset between the client and the server, only used by a client
    /// configured to ignore time skew.
    pub client_offset: Duration,
    /// Maximum size of a message in bytes. 0 means no limit.
    pub max_message_size: usize,
    /// Maximum number of chunks. 0 means no limit.
    pub max_chunk_count: usize,
    /// Maximum length in bytes (not chars!) of a string. 0 actually means 0, i.e. no string permitted.
    pub max_string_length: usize,
    /// Maximum length in bytes of a byte string. 0 actually means 0, i.e. no byte string permitted.
    pub max_byte_string_length: usize,
    /// Maximum number of array elements. 0 actually means 0, i.e. no array permitted.
    pub max_array_length: usize,
}

impl Default for DecodingOptions {
    fn default() -> Self {
        DecodingOptions {
            client_offset: Duration::zero(),
            max_message_size: constants::MAX_MESSAGE_SIZE,
            max_chunk_count: constants::MAX_CHUNK_COUNT,
            max_string_length: constants::MAX_STRING_LENGTH,
            max_byte_string_length: constants::MAX_BYTE_STRING_LENGTH,
            max_array_length: constants::MAX_ARRAY_LENGTH,
        }
    }
}

impl DecodingOptions {
    /// This can be useful for decoding extension objects where the payload is
    /// not expected to contain a large value.
    pub fn minimal() -> Self {
        DecodingOptions {
            max_string_length: 8192,
            max_byte_string_length: 8192,
            max_array_length: 8192,
            ..Default::default()
        }
    }

    /// For test only. Having a separate function makes it easier to control
    /// calls to `DecodingOptions::default()`.
    pub fn test() -> Self {
        Self::default()
    }
}

/// Trait for encoding a type to OPC UA binary.
pub trait SimpleBinaryEncodable {
    /// Returns the exact byte length of the structure as it would be if `encode` were called.
    /// This may be called prior to writing to ensure the correct amount of space is available.
    fn byte_len(&self) -> usize;

    /// Encodes the instance to the write stream.
    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()>;

    /// Convenience method for encoding a message straight into an array of bytes.
    /// It is preferable to reuse buffers than to call this, so it should be
    /// reserved for tests and trivial code.
    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buffer = std::io::Cursor::new(Vec::with_capacity(self.byte_len()));
        let _ = self.encode(&mut buffer);
        buffer.into_inner()
    }
}

/// Trait for decoding a type from OPC UA binary.
pub trait SimpleBinaryDecodable: Sized {
    /// Decodes an instance from the read stream. The decoding options contain
    /// restrictions set by the server / client on the length of strings,
    /// arrays etc. If these limits are exceeded the implementation should
    /// return a `BadDecodingError` as soon as possible.
    fn decode<S: Read + ?Sized>(
        stream: &mut S,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self>;
}

/// Converts an IO encoding error into an EncodingResult.
pub fn process_encode_io_result(result: Result<()>) -> EncodingResult<()> {
    result.map_err(Error::encoding)
}

/// Converts an IO decoding error into an EncodingResult.
pub fn process_decode_io_result<T>(result: Result<T>) -> EncodingResult<T>
where
    T: Debug,
{
    result.map_err(Error::decoding)
}

/// Writes a series of identical bytes to the stream.
pub fn write_bytes<W: Write + ?Sized>(
    stream: &mut W,
    value: u8,
    count: usize,
) -> EncodingResult<usize> {
    for _ in 0..count {
        process_encode_io_result(stream.write_u8(value))?;
    }
    Ok(count)
}

/// Writes an unsigned byte to the stream.
pub fn write_u8<T, W: Write + ?Sized>(stream: &mut W, value: T) -> EncodingResult<()>
where
    T: Into<u8>,
{
    process_encode_io_result(stream.write_u8(value.into()))
}

/// Writes a signed 32-bit value to the stream.
pub fn write_i32<T, W: Write + ?Sized>(stream: &mut W, value: T) -> EncodingResult<()>
where
    T: Into<i32>,
{
    process_encode_io_result(stream.write_i32::<LittleEndian>(value.into()))
}

/// Writes an unsigned 16-bit value to the stream.
pub fn write_u16<T, W: Write + ?Sized>(stream: &mut W, value: T) -> EncodingResult<()>
where
    T: Into<u16>,
{
    process_encode_io_result(stream.write_u16::<LittleEndian>(value.into()))
}

/// Writes an unsigned 32-bit value to the stream.
pub fn write_u32<T, W: Write + ?Sized>(stream: &mut W, value: T) -> EncodingResult<()>
where
    T: Into<u32>,
{
    process_encode_io_result(stream.write_u32::<LittleEndian>(value.into()))
}

/// Writes a signed 64-bit value to the stream.
pub fn write_i64<T, W: Write + ?Sized>(stream: &mut W, value: T) -> EncodingResult<()>
where
    T: Into<i64>,
{
    process_encode_io_result(stream.write_i64::<LittleEndian>(value.into()))
}

/// Reads an array of bytes from the stream.
pub fn read_bytes<R: Read + ?Sized>(stream: &mut R, buf: &mut [u8]) -> EncodingResult<usize> {
    process_decode_io_result(stream.read_exact(buf))?;
    Ok(buf.len())
}

/// Reads an unsigned byte from the stream.
pub fn read_u8<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<u8> {
    process_decode_io_result(stream.read_u8())
}

/// Reads an unsigned 16-bit value from the stream.
pub fn read_u16<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<u16> {
    process_decode_io_result(stream.read_u16::<LittleEndian>())
}

/// Reads a signed 32-bit value from the stream.
pub fn read_i32<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<i32> {
    process_decode_io_result(stream.read_i32::<LittleEndian>())
}

/// Reads an unsigned 32-bit value from the stream.
pub fn read_u32<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<u32> {
    process_decode_io_result(stream.read_u32::<LittleEndian>())
}

/// Reads a signed 64-bit value from the stream.
pub fn read_i64<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<i64> {
    process_decode_io_result(stream.read_i64::<LittleEndian>())
}

impl SimpleBinaryEncodable for u32 {
    fn byte_len(&self) -> usize {
        4
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        write_u32(stream, *self)
    }
}

impl SimpleBinaryDecodable for u32 {
    fn decode<S: Read + ?Sized>(stream: &mut S, _: &DecodingOptions) -> EncodingResult<Self> {
        read_u32(stream)
    }
}

impl SimpleBinaryEncodable for i32 {
    fn byte_len(&self) -> usize {
        4
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        write_i32(stream, *self)
    }
}

impl SimpleBinaryDecodable for i32 {
    fn decode<S: Read + ?Sized>(stream: &mut S, _: &DecodingOptions) -> EncodingResult<Self> {
        read_i32(stream)
    }
}

/// Computes the byte length of an optional array. A null array encodes as a
/// single `-1` length prefix.
pub fn array_byte_len<T: SimpleBinaryEncodable>(values: &Option<Vec<T>>) -> usize {
    match values {
        Some(values) => 4 + values.iter().map(|v| v.byte_len()).sum::<usize>(),
        None => 4,
    }
}

/// Writes an optional array with its length prefix.
pub fn write_array<S: Write + ?Sized, T: SimpleBinaryEncodable>(
    stream: &mut S,
    values: &Option<Vec<T>>,
) -> EncodingResult<()> {
    match values {
        Some(values) => {
            write_i32(stream, values.len() as i32)?;
            for value in values {
                value.encode(stream)?;
            }
            Ok(())
        }
        None => write_i32(stream, -1),
    }
}

/// Reads an optional array with its length prefix, enforcing
/// `max_array_length`.
pub fn read_array<S: Read + ?Sized, T: SimpleBinaryDecodable>(
    stream: &mut S,
    decoding_options: &DecodingOptions,
) -> EncodingResult<Option<Vec<T>>> {
    let len = read_i32(stream)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    if len > decoding_options.max_array_length {
        return Err(Error::decoding(format!(
            "Array length {} exceeds decoding limit {}",
            len, decoding_options.max_array_length
        )));
    }
    let mut values = Vec::with_capacity(len);
    for _ in 0..len {
        values.push(T::decode(stream, decoding_options)?);
    }
    Ok(Some(values))
}
