//! Compute request protocol.
//!
//! Each request on a connection follows the same exchange:
//!
//! ```text
//! Client: kmeans -k 3 -f data.txt\n
//! Server: kmeans_client1_soln1.txt\0
//! Client: <transfer: uploaded input>      (kmeans with -f only)
//! Server: <transfer: result artifact>
//! ```
//!
//! An unknown operation is answered with [`ERROR_PAYLOAD`] and the
//! connection is closed. Transfers are framed by [`transfer`].

pub mod transfer;

use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;

/// Maximum length of a command line, terminator excluded.
pub const MAX_COMMAND_LEN: usize = 255;

/// Fixed diagnostic sent for an unrecognized operation.
pub const ERROR_PAYLOAD: &str = "Error! Valid commands: 'matinv' or 'kmeans'";

/// One of the two compute operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Kmeans,
    Matinv,
}

impl Operation {
    /// Parse an operation name. Matching is exact.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "kmeans" => Some(Operation::Kmeans),
            "matinv" => Some(Operation::Matinv),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Operation::Kmeans => "kmeans",
            Operation::Matinv => "matinv",
        }
    }

    /// Whether the job takes an uploaded input file via `-f`.
    pub fn accepts_upload(self) -> bool {
        matches!(self, Operation::Kmeans)
    }

    /// Whether the job prints its result instead of writing the `-p` file.
    pub fn writes_stdout(self) -> bool {
        matches!(self, Operation::Matinv)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A validated client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub op: Operation,
    pub args: Vec<String>,
}

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    Complete(Command),
    /// The first token is missing or not a known operation.
    UnknownOperation(String),
}

/// Parse a command line into an operation and its argument tokens.
pub fn parse(line: &str) -> ParseResult {
    let mut tokens = line.split_whitespace();
    let name = tokens.next().unwrap_or("");

    match Operation::from_name(name) {
        Some(op) => ParseResult::Complete(Command {
            op,
            args: tokens.map(str::to_string).collect(),
        }),
        None => ParseResult::UnknownOperation(name.to_string()),
    }
}

/// Advisory filename for the `solution`-th result of client `client`.
pub fn solution_name(op: Operation, client: u64, solution: u64) -> String {
    format!("{op}_client{client}_soln{solution}.txt")
}

/// Write a NUL-terminated message.
pub fn send_message<W: Write>(writer: &mut W, message: &str) -> io::Result<()> {
    writer.write_all(message.as_bytes())?;
    writer.write_all(&[0])?;
    writer.flush()
}

/// Read a NUL-terminated message, as sent by [`send_message`].
#[cfg(test)]
pub fn recv_message<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut message = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if reader.read(&mut byte)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside message",
            ));
        }
        if byte[0] == 0 {
            break;
        }
        message.push(byte[0]);
    }
    String::from_utf8(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Outcome of reading one command line.
#[derive(Debug, PartialEq, Eq)]
pub enum CommandLine {
    Line(String),
    /// More than [`MAX_COMMAND_LEN`] bytes before the terminator. The rest
    /// of the line has been discarded.
    TooLong,
    Eof,
}

/// Read one command line from the connection.
///
/// The line ends at `\n` or `\0` and holds at most [`MAX_COMMAND_LEN`]
/// bytes, so the terminator may arrive as byte `MAX_COMMAND_LEN + 1`.
/// Bytes past the terminator are left in the socket, so an upload that
/// follows the command is never consumed here.
pub fn read_command_line(stream: &TcpStream) -> io::Result<CommandLine> {
    let mut line: Vec<u8> = Vec::with_capacity(MAX_COMMAND_LEN);
    let mut buf = [0u8; MAX_COMMAND_LEN + 1];
    let mut reader = stream;

    loop {
        let room = MAX_COMMAND_LEN + 1 - line.len();
        let n = stream.peek(&mut buf[..room])?;
        if n == 0 {
            return Ok(CommandLine::Eof);
        }

        match buf[..n].iter().position(|&b| is_terminator(b)) {
            Some(pos) => {
                reader.read_exact(&mut buf[..=pos])?;
                line.extend_from_slice(&buf[..pos]);
                break;
            }
            None if line.len() + n > MAX_COMMAND_LEN => {
                reader.read_exact(&mut buf[..n])?;
                skip_line(stream)?;
                return Ok(CommandLine::TooLong);
            }
            None => {
                reader.read_exact(&mut buf[..n])?;
                line.extend_from_slice(&buf[..n]);
            }
        }
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(CommandLine::Line(String::from_utf8_lossy(&line).into_owned()))
}

fn is_terminator(b: u8) -> bool {
    b == b'\n' || b == 0
}

/// Consume bytes up to and including the next terminator, or until EOF.
fn skip_line(stream: &TcpStream) -> io::Result<()> {
    let mut buf = [0u8; 512];
    let mut reader = stream;

    loop {
        let n = stream.peek(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        match buf[..n].iter().position(|&b| is_terminator(b)) {
            Some(pos) => return reader.read_exact(&mut buf[..=pos]),
            None => reader.read_exact(&mut buf[..n])?,
        }
    }
}
