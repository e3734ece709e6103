//! Shared protocol constants for the ferry wire format
//!
//! ```text
//! Frame := FilenameLen(u32) Filename(bytes) FileLen(u32) Chunk*
//! Chunk := ChunkLen(u32) ChunkBytes(bytes[ChunkLen])
//! ```
//!
//! There is no magic, version byte or end-of-file marker: a frame ends when the
//! chunk lengths add up to `FileLen`, and a connection ends with an orderly
//! close at a frame boundary.
//!
//! Integers travel in HOST byte order. This keeps ferry byte-for-byte
//! compatible with the original socket_fsm tool; moving to a fixed order would
//! break that and must come with a protocol version.

use std::io::{self, Read, Write};

/// Size of every length field on the wire.
pub const LEN_FIELD: usize = 4;

/// Largest chunk payload a sender emits and a receiver accepts.
pub const MAX_CHUNK_LEN: usize = 1023;

/// Longest filename accepted by a receiver (PATH_MAX on Linux).
pub const MAX_FILENAME_LEN: usize = 4096;

/// Encode a length field.
pub fn build_len_field(value: u32) -> [u8; LEN_FIELD] {
    value.to_ne_bytes()
}

/// Decode a length field.
pub fn parse_len_field(field: [u8; LEN_FIELD]) -> u32 {
    u32::from_ne_bytes(field)
}

/// Write one length field in full.
pub fn write_len<W: Write + ?Sized>(out: &mut W, value: u32) -> io::Result<()> {
    out.write_all(&build_len_field(value))
}

/// Read one length field in full, retrying short reads.
pub fn read_len<R: Read + ?Sized>(input: &mut R) -> io::Result<u32> {
    let mut field = [0u8; LEN_FIELD];
    input.read_exact(&mut field)?;
    Ok(parse_len_field(field))
}
