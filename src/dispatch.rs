//! Compute job invocation.
//!
//! Runs the external `kmeans`/`matinv` executables for one request:
//! prepares the client's result directory, receives the optional upload,
//! spawns the job with an explicit argument vector (no shell) and returns
//! the result file over the connection.

use crate::protocol::transfer::{self, TransferError};
use crate::protocol::{Command, Operation};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{self, ExitStatus, Stdio};
use tracing::{debug, info};

/// Flag announcing an uploaded input file.
pub const INPUT_FLAG: &str = "-f";

/// Flag carrying the output path.
pub const OUTPUT_FLAG: &str = "-p";

/// Name of the uploaded input inside the client's result directory.
pub const INPUT_FILENAME: &str = "input.txt";

/// Dispatch errors. All of them end the session.
#[derive(Debug)]
pub enum DispatchError {
    CreateDir(PathBuf, io::Error),
    CreateFile(PathBuf, io::Error),
    Spawn(PathBuf, io::Error),
    Wait(PathBuf, io::Error),
    Exit(PathBuf, ExitStatus),
    Transfer(TransferError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::CreateDir(path, e) => {
                write!(f, "cannot create result directory '{}': {}", path.display(), e)
            }
            DispatchError::CreateFile(path, e) => {
                write!(f, "cannot create result file '{}': {}", path.display(), e)
            }
            DispatchError::Spawn(program, e) => {
                write!(f, "cannot start program '{}': {}", program.display(), e)
            }
            DispatchError::Wait(program, e) => {
                write!(f, "cannot wait for program '{}': {}", program.display(), e)
            }
            DispatchError::Exit(program, status) => {
                write!(f, "program '{}' failed: {}", program.display(), status)
            }
            DispatchError::Transfer(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<TransferError> for DispatchError {
    fn from(e: TransferError) -> Self {
        DispatchError::Transfer(e)
    }
}

/// Runs compute jobs below a results root.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    results_dir: PathBuf,
    bin_dir: PathBuf,
}

impl Dispatcher {
    pub fn new(results_dir: impl Into<PathBuf>, bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
            bin_dir: bin_dir.into(),
        }
    }

    /// Result directory of a client.
    pub fn client_dir(&self, client: u64) -> PathBuf {
        self.results_dir.join(format!("client{client}"))
    }

    /// Storage path of a client's `solution`-th result.
    pub fn result_path(&self, client: u64, solution: u64) -> PathBuf {
        self.client_dir(client).join(format!("{solution}.txt"))
    }

    /// Executable implementing an operation.
    pub fn program(&self, op: Operation) -> PathBuf {
        self.bin_dir.join(op.name())
    }

    /// Run one request and send the result back over `stream`.
    ///
    /// If the command carries an upload, it is read from `stream` first.
    /// Partial files are left in place on failure.
    pub fn run<S: Read + Write>(
        &self,
        stream: &mut S,
        command: &Command,
        client: u64,
        solution: u64,
    ) -> Result<(), DispatchError> {
        let client_dir = self.client_dir(client);
        fs::create_dir_all(&client_dir)
            .map_err(|e| DispatchError::CreateDir(client_dir.clone(), e))?;

        let mut args = command.args.clone();
        if command.op.accepts_upload() && args.iter().any(|a| a == INPUT_FLAG) {
            let input = client_dir.join(INPUT_FILENAME);
            let len = transfer::recv_file(stream, &input)?;
            debug!(client, solution, bytes = len, path = %input.display(), "Received input file");
            rewrite_input(&mut args, &input);
        }

        let output = self.result_path(client, solution);
        args.push(OUTPUT_FLAG.to_string());
        args.push(output.display().to_string());

        self.execute(command.op, &args, &output)?;

        let len = transfer::send_file(&output, stream)?;
        info!(client, solution, op = %command.op, bytes = len, "Sent solution");
        Ok(())
    }

    /// Spawn the job and block until it exits.
    fn execute(&self, op: Operation, args: &[String], output: &Path) -> Result<(), DispatchError> {
        let program = self.program(op);

        let stdout = if op.writes_stdout() {
            let file = File::create(output)
                .map_err(|e| DispatchError::CreateFile(output.to_path_buf(), e))?;
            Stdio::from(file)
        } else {
            Stdio::null()
        };

        debug!(program = %program.display(), ?args, "Starting job");
        let mut child = process::Command::new(&program)
            .args(args)
            .current_dir(&self.bin_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| DispatchError::Spawn(program.clone(), e))?;

        // Reaps the child; nothing is left behind as a zombie.
        let status = child
            .wait()
            .map_err(|e| DispatchError::Wait(program.clone(), e))?;

        if !status.success() {
            return Err(DispatchError::Exit(program, status));
        }
        Ok(())
    }
}

/// Drop every client-supplied `-f` pair and pass the uploaded file once.
fn rewrite_input(args: &mut Vec<String>, input: &Path) {
    let mut kept = Vec::with_capacity(args.len() + 2);
    let mut tokens = std::mem::take(args).into_iter();
    while let Some(arg) = tokens.next() {
        if arg == INPUT_FLAG {
            tokens.next();
        } else {
            kept.push(arg);
        }
    }

    kept.push(INPUT_FLAG.to_string());
    kept.push(input.display().to_string());
    *args = kept;
}
