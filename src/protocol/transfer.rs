//! Length-prefixed file transfer.
//!
//! ```text
//! <20 ASCII digits, zero padded><exactly that many raw bytes>
//!
//! Example:
//! 00000000000000000005hello
//! ```
//!
//! The length field width does not depend on the value, so both ends always
//! agree on where the payload starts. There is no end marker.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

/// Width of the length field in bytes. Holds any `u64` in decimal.
pub const LENGTH_FIELD_WIDTH: usize = 20;

/// Payload bytes moved per read/write call.
pub const CHUNK_SIZE: usize = 4096;

/// Transfer errors.
#[derive(Debug)]
pub enum TransferError {
    /// Socket failure while sending or receiving.
    Io(io::Error),
    /// Connection closed before the full length field arrived.
    ShortLength { received: usize },
    /// Length field is not a zero-padded decimal number.
    InvalidLength(String),
    /// Connection closed before the declared payload arrived.
    Truncated { expected: u64, received: u64 },
    /// Failure reading the local file being sent.
    Source(io::Error),
    /// Failure writing the local file being received.
    Sink(io::Error),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Io(e) => write!(f, "transfer I/O error: {}", e),
            TransferError::ShortLength { received } => write!(
                f,
                "short length field: {} of {} bytes",
                received, LENGTH_FIELD_WIDTH
            ),
            TransferError::InvalidLength(field) => {
                write!(f, "malformed length field: {:?}", field)
            }
            TransferError::Truncated { expected, received } => write!(
                f,
                "connection closed after {} of {} bytes",
                received, expected
            ),
            TransferError::Source(e) => write!(f, "cannot read file to send: {}", e),
            TransferError::Sink(e) => write!(f, "cannot write received file: {}", e),
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransferError::Io(e) | TransferError::Source(e) | TransferError::Sink(e) => Some(e),
            _ => None,
        }
    }
}

/// Encode a length into its fixed-width field.
pub fn encode_length(len: u64) -> [u8; LENGTH_FIELD_WIDTH] {
    let mut field = [0u8; LENGTH_FIELD_WIDTH];
    field.copy_from_slice(format!("{:0width$}", len, width = LENGTH_FIELD_WIDTH).as_bytes());
    field
}

/// Decode a fixed-width length field.
pub fn decode_length(field: &[u8; LENGTH_FIELD_WIDTH]) -> Result<u64, TransferError> {
    let invalid = || TransferError::InvalidLength(String::from_utf8_lossy(field).into_owned());

    if !field.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(invalid)
}

/// Send `len` bytes from `source`, preceded by the length field.
pub fn send<R: Read, W: Write>(source: &mut R, len: u64, sink: &mut W) -> Result<(), TransferError> {
    sink.write_all(&encode_length(len))
        .map_err(TransferError::Io)?;

    let mut buf = [0u8; CHUNK_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let n = match source.read(&mut buf[..want]) {
            Ok(0) => {
                return Err(TransferError::Source(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("source ended {} bytes early", remaining),
                )))
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::Source(e)),
        };
        sink.write_all(&buf[..n]).map_err(TransferError::Io)?;
        remaining -= n as u64;
    }

    sink.flush().map_err(TransferError::Io)
}

/// Send the file at `path`, declaring its size as reported by the filesystem.
pub fn send_file<W: Write>(path: &Path, sink: &mut W) -> Result<u64, TransferError> {
    let mut file = File::open(path).map_err(TransferError::Source)?;
    let len = file.metadata().map_err(TransferError::Source)?.len();
    send(&mut file, len, sink)?;
    Ok(len)
}

/// Receive one transfer from `source`, streaming the payload into `sink`.
///
/// Returns the number of payload bytes written.
pub fn recv<R: Read, W: Write>(source: &mut R, sink: &mut W) -> Result<u64, TransferError> {
    let mut field = [0u8; LENGTH_FIELD_WIDTH];
    let mut filled = 0;
    while filled < LENGTH_FIELD_WIDTH {
        match source.read(&mut field[filled..]) {
            Ok(0) => return Err(TransferError::ShortLength { received: filled }),
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::Io(e)),
        }
    }
    let expected = decode_length(&field)?;

    let mut buf = [0u8; CHUNK_SIZE];
    let mut received = 0u64;
    while received < expected {
        let want = (expected - received).min(CHUNK_SIZE as u64) as usize;
        let n = match source.read(&mut buf[..want]) {
            Ok(0) => return Err(TransferError::Truncated { expected, received }),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::Io(e)),
        };
        sink.write_all(&buf[..n]).map_err(TransferError::Sink)?;
        received += n as u64;
    }

    sink.flush().map_err(TransferError::Sink)?;
    Ok(received)
}

/// Receive one transfer into a newly created (or truncated) file at `path`.
pub fn recv_file<R: Read>(source: &mut R, path: &Path) -> Result<u64, TransferError> {
    let mut file = File::create(path).map_err(TransferError::Sink)?;
    recv(source, &mut file)
}
