//! Per-connection session state machine.
//!
//! A session moves through three states:
//!
//! ```text
//! AwaitingCommand --line--> Dispatching --ok--> AwaitingCommand
//!        |                       |
//!        +--EOF/error------------+--violation/failure--> Terminated
//! ```
//!
//! Sessions share nothing but the read-only [`ServerContext`]; client ids
//! come from one atomic counter so result directories never collide.

use crate::config::Config;
use crate::dispatch::{DispatchError, Dispatcher};
use crate::protocol::transfer::TransferError;
use crate::protocol::{self, CommandLine, ParseResult, ERROR_PAYLOAD, MAX_COMMAND_LEN};
use std::fmt;
use std::io;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

/// Process-wide client id allocator. Ids start at 1 and are never reused.
#[derive(Debug, Default)]
pub struct ClientIds {
    last: AtomicU64,
}

impl ClientIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next client id.
    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Read-only state shared by every execution context.
#[derive(Debug)]
pub struct ServerContext {
    pub dispatcher: Dispatcher,
    pub client_ids: ClientIds,
}

impl ServerContext {
    pub fn new(config: &Config) -> Self {
        Self {
            dispatcher: Dispatcher::new(&config.results_dir, &config.bin_dir),
            client_ids: ClientIds::new(),
        }
    }

    /// Create the session for a freshly accepted connection.
    pub fn open_session(&self) -> Session {
        let client_id = self.client_ids.next();
        Session {
            client_id,
            solution_num: 0,
            result_dir: self.dispatcher.client_dir(client_id),
            state: SessionState::AwaitingCommand,
        }
    }
}

/// Current state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingCommand,
    Dispatching,
    Terminated,
}

/// Session-fatal errors.
#[derive(Debug)]
pub enum SessionError {
    /// The peer broke the protocol.
    Protocol(String),
    /// Socket read/write failure or peer gone mid-transfer.
    Transport(io::Error),
    /// Job launch or filesystem failure.
    Dispatch(DispatchError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            SessionError::Transport(e) => write!(f, "transport failure: {}", e),
            SessionError::Dispatch(e) => write!(f, "dispatch failure: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Transport(e)
    }
}

impl From<DispatchError> for SessionError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Transfer(TransferError::Io(e)) => SessionError::Transport(e),
            DispatchError::Transfer(e @ TransferError::Truncated { .. }) => {
                SessionError::Transport(io::Error::new(io::ErrorKind::UnexpectedEof, e.to_string()))
            }
            DispatchError::Transfer(
                e @ (TransferError::ShortLength { .. } | TransferError::InvalidLength(_)),
            ) => SessionError::Protocol(e.to_string()),
            other => SessionError::Dispatch(other),
        }
    }
}

/// Outcome of one request/response cycle.
#[derive(Debug, PartialEq, Eq)]
pub enum Cycle {
    /// Request served, session waits for the next command.
    Continue,
    /// Session is over, the connection should be closed.
    Closed,
}

/// Server-side state of one client connection.
#[derive(Debug)]
pub struct Session {
    client_id: u64,
    solution_num: u64,
    result_dir: PathBuf,
    state: SessionState,
}

impl Session {
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn solution_num(&self) -> u64 {
        self.solution_num
    }

    #[cfg(test)]
    pub fn result_dir(&self) -> &PathBuf {
        &self.result_dir
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serve requests until the peer disconnects or the session fails.
    pub fn run(&mut self, stream: &mut TcpStream, dispatcher: &Dispatcher) {
        info!(
            client = self.client_id,
            dir = %self.result_dir.display(),
            "Connected with client"
        );
        while self.serve_one(stream, dispatcher) == Cycle::Continue {}
        info!(
            client = self.client_id,
            solutions = self.solution_num,
            "Closing connection"
        );
    }

    /// Run exactly one request/response cycle.
    ///
    /// Errors are logged here and end the session; they never propagate to
    /// the caller's accept loop.
    pub fn serve_one(&mut self, stream: &mut TcpStream, dispatcher: &Dispatcher) -> Cycle {
        if self.state == SessionState::Terminated {
            return Cycle::Closed;
        }

        match self.try_serve_one(stream, dispatcher) {
            Ok(cycle) => {
                if cycle == Cycle::Closed {
                    self.state = SessionState::Terminated;
                }
                cycle
            }
            Err(e) => {
                self.state = SessionState::Terminated;
                match &e {
                    SessionError::Protocol(msg) => {
                        warn!(client = self.client_id, error = %e, "Closing session");
                        // Best effort: the peer may already be gone.
                        let _ = protocol::send_message(stream, &format!("Error! {msg}"));
                    }
                    SessionError::Transport(_) => {
                        debug!(client = self.client_id, error = %e, "Closing session");
                    }
                    SessionError::Dispatch(_) => {
                        error!(client = self.client_id, error = %e, "Closing session");
                    }
                }
                Cycle::Closed
            }
        }
    }

    fn try_serve_one(
        &mut self,
        stream: &mut TcpStream,
        dispatcher: &Dispatcher,
    ) -> Result<Cycle, SessionError> {
        self.state = SessionState::AwaitingCommand;
        let line = match protocol::read_command_line(stream) {
            Ok(CommandLine::Line(line)) => line,
            Ok(CommandLine::TooLong) => {
                return Err(SessionError::Protocol(format!(
                    "command line longer than {MAX_COMMAND_LEN} bytes"
                )));
            }
            Ok(CommandLine::Eof) => return Ok(Cycle::Closed),
            Err(e) => {
                debug!(client = self.client_id, error = %e, "Read failed");
                return Ok(Cycle::Closed);
            }
        };

        self.state = SessionState::Dispatching;
        info!(client = self.client_id, command = %line, "Client commanded");

        let command = match protocol::parse(&line) {
            ParseResult::Complete(command) => command,
            ParseResult::UnknownOperation(op) => {
                warn!(client = self.client_id, op = %op, "Unknown operation");
                protocol::send_message(stream, ERROR_PAYLOAD)?;
                return Ok(Cycle::Closed);
            }
        };

        self.solution_num += 1;
        let name = protocol::solution_name(command.op, self.client_id, self.solution_num);
        debug!(client = self.client_id, solution = %name, "Sending solution name");
        protocol::send_message(stream, &name)?;

        dispatcher.run(stream, &command, self.client_id, self.solution_num)?;

        self.state = SessionState::AwaitingCommand;
        Ok(Cycle::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::transfer;
    use crate::testutil;
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    /// Accept one connection and run a session on it in the background.
    fn serve_once(ctx: Arc<ServerContext>) -> (TcpStream, thread::JoinHandle<Session>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut session = ctx.open_session();
            session.run(&mut stream, &ctx.dispatcher);
            session
        });
        (client, handle)
    }

    #[test]
    fn test_client_ids_unique_and_increasing() {
        let ids = Arc::new(ClientIds::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                thread::spawn(move || (0..100).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        assert_eq!(all, (1..=400).collect::<Vec<_>>());
    }

    #[test]
    fn test_open_session() {
        let results = tempfile::tempdir().unwrap();
        let ctx = testutil::context(results.path());

        let first = ctx.open_session();
        let second = ctx.open_session();
        assert_eq!(first.client_id(), 1);
        assert_eq!(second.client_id(), 2);
        assert_eq!(second.solution_num(), 0);
        assert_eq!(second.result_dir(), &results.path().join("client2"));
        assert_eq!(second.state(), SessionState::AwaitingCommand);
    }

    #[test]
    fn test_request_scenario() {
        let results = tempfile::tempdir().unwrap();
        let (mut client, handle) = serve_once(testutil::context(results.path()));

        client.write_all(b"kmeans arg1 arg2\n").unwrap();
        assert_eq!(
            protocol::recv_message(&mut client).unwrap(),
            "kmeans_client1_soln1.txt"
        );
        let mut result = Vec::new();
        let len = transfer::recv(&mut client, &mut result).unwrap();
        assert_eq!(len as usize, result.len());
        assert_eq!(result, b"kmeans arg1 arg2\n");

        client.write_all(b"matinv -n 2\n").unwrap();
        assert_eq!(
            protocol::recv_message(&mut client).unwrap(),
            "matinv_client1_soln2.txt"
        );
        transfer::recv(&mut client, &mut Vec::new()).unwrap();

        drop(client);
        let session = handle.join().unwrap();
        assert_eq!(session.solution_num(), 2);
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(results.path().join("client1/1.txt").exists());
        assert!(results.path().join("client1/2.txt").exists());
    }

    #[test]
    fn test_unknown_operation_closes_session() {
        let results = tempfile::tempdir().unwrap();
        let (mut client, handle) = serve_once(testutil::context(results.path()));

        client.write_all(b"rm -rf /\n").unwrap();
        assert_eq!(protocol::recv_message(&mut client).unwrap(), ERROR_PAYLOAD);

        let session = handle.join().unwrap();
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(session.solution_num(), 0);
        // Nothing was dispatched.
        assert!(!results.path().join("client1").exists());

        // Server side is closed.
        let mut buf = [0u8; 1];
        assert_eq!(std::io::Read::read(&mut client, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_upload_scenario() {
        let results = tempfile::tempdir().unwrap();
        let (mut client, handle) = serve_once(testutil::context(results.path()));

        let upload = b"0.5 0.5\n1.5 2.5\n9.0 9.0\n";
        client.write_all(b"kmeans -k 2 -f points.txt\n").unwrap();
        assert_eq!(
            protocol::recv_message(&mut client).unwrap(),
            "kmeans_client1_soln1.txt"
        );
        transfer::send(&mut &upload[..], upload.len() as u64, &mut client).unwrap();

        let mut result = Vec::new();
        transfer::recv(&mut client, &mut result).unwrap();
        assert_eq!(result, upload);
        assert_eq!(
            std::fs::read(results.path().join("client1/input.txt")).unwrap(),
            upload
        );

        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn test_malformed_upload_length_closes_session() {
        let results = tempfile::tempdir().unwrap();
        let (mut client, handle) = serve_once(testutil::context(results.path()));

        client.write_all(b"kmeans -f points.txt\n").unwrap();
        protocol::recv_message(&mut client).unwrap();
        client.write_all(b"not-a-length-field!!").unwrap();

        let diagnostic = protocol::recv_message(&mut client).unwrap();
        assert!(diagnostic.starts_with("Error!"));

        let session = handle.join().unwrap();
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[test]
    fn test_overlong_command_runs_nothing() {
        let results = tempfile::tempdir().unwrap();
        let (mut client, handle) = serve_once(testutil::context(results.path()));

        let mut wire = b"kmeans ".to_vec();
        wire.extend_from_slice(&[b'x'; 248]);
        wire.extend_from_slice(b"matinv -n 9\n");
        client.write_all(&wire).unwrap();

        let diagnostic = protocol::recv_message(&mut client).unwrap();
        assert!(diagnostic.starts_with("Error!"));

        let session = handle.join().unwrap();
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(session.solution_num(), 0);
        assert!(!results.path().join("client1").exists());
    }

    #[test]
    fn test_command_at_length_bound_is_served() {
        let results = tempfile::tempdir().unwrap();
        let (mut client, handle) = serve_once(testutil::context(results.path()));

        let mut wire = b"matinv ".to_vec();
        wire.extend_from_slice(&[b'y'; 248]);
        assert_eq!(wire.len(), MAX_COMMAND_LEN);
        wire.push(b'\n');
        client.write_all(&wire).unwrap();

        assert_eq!(
            protocol::recv_message(&mut client).unwrap(),
            "matinv_client1_soln1.txt"
        );
        let mut result = Vec::new();
        transfer::recv(&mut client, &mut result).unwrap();
        assert!(result.starts_with(b"matinv yyy"));

        // No stray command left behind: the server sees EOF next, not a line.
        client.shutdown(std::net::Shutdown::Write).unwrap();
        let mut rest = Vec::new();
        std::io::Read::read_to_end(&mut client, &mut rest).unwrap();
        assert!(rest.is_empty());

        let session = handle.join().unwrap();
        assert_eq!(session.solution_num(), 1);
    }

    #[test]
    fn test_failing_job_terminates_session() {
        let results = tempfile::tempdir().unwrap();
        let (mut client, handle) = serve_once(testutil::context(results.path()));

        client.write_all(b"kmeans fail\n").unwrap();
        protocol::recv_message(&mut client).unwrap();

        let session = handle.join().unwrap();
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(session.solution_num(), 1);
    }
}
