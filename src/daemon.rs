//! Detaching from the controlling terminal.
//!
//! [`detach`] is the whole lifecycle transform: the caller has already
//! resolved every path against the original working directory, the process
//! moves to the background with `/` as working directory and its standard
//! streams on `/dev/null`, and logging goes to a file opened beforehand
//! instead of the terminal (see `main`).

use std::io;

/// Detach the process from its controlling terminal.
///
/// Must run before any thread is spawned: only the calling thread survives
/// into the background process.
pub fn detach() -> io::Result<()> {
    // SAFETY: daemon(3) forks and exits the parent; no other threads exist
    // yet, so nothing is lost across the fork.
    let rc = unsafe { libc::daemon(0, 0) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

