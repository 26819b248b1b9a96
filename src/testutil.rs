//! Test fixtures: stand-in compute jobs honoring the `-f`/`-p` contract,
//! plus a minimal blocking client.
//!
//! `kmeans` writes its output file itself (a copy of `-f` if given,
//! otherwise its arguments); `matinv` prints its arguments to stdout.
//! Both exit 3 on a `fail` argument and sleep one second on `slow`.

use crate::dispatch::Dispatcher;
use crate::protocol::{self, transfer, ERROR_PAYLOAD};
use crate::session::{ClientIds, ServerContext};
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::thread;
use tempfile::TempDir;

const KMEANS: &str = r#"#!/bin/sh
out=""; in=""; rest=""
while [ $# -gt 0 ]; do
    case "$1" in
        -p) out="$2"; shift ;;
        -f) in="$2"; shift ;;
        fail) exit 3 ;;
        slow) sleep 1; rest="$rest $1" ;;
        *) rest="$rest $1" ;;
    esac
    shift
done
if [ -n "$in" ]; then
    cat "$in" > "$out"
else
    echo "kmeans$rest" > "$out"
fi
"#;

const MATINV: &str = r#"#!/bin/sh
rest=""
while [ $# -gt 0 ]; do
    case "$1" in
        -p) shift ;;
        fail) exit 3 ;;
        slow) sleep 1; rest="$rest $1" ;;
        *) rest="$rest $1" ;;
    esac
    shift
done
echo "matinv$rest"
"#;

static JOBS: OnceLock<TempDir> = OnceLock::new();

/// Directory holding the fake `kmeans` and `matinv` executables.
///
/// Written once per test process. Every test that spawns a process must
/// call this first, so no fork can inherit a script still open for writing.
pub fn fake_jobs() -> &'static Path {
    JOBS.get_or_init(|| {
        let dir = tempfile::tempdir().expect("create job dir");
        for (name, script) in [("kmeans", KMEANS), ("matinv", MATINV)] {
            let path = dir.path().join(name);
            fs::write(&path, script).expect("write job script");
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                .expect("make job executable");
        }
        dir
    })
    .path()
}

/// Shared context running the fake jobs, with results under `results`.
pub fn context(results: &Path) -> Arc<ServerContext> {
    Arc::new(ServerContext {
        dispatcher: Dispatcher::new(results, fake_jobs()),
        client_ids: ClientIds::new(),
    })
}

/// Send one command line.
pub fn send_line(stream: &mut TcpStream, line: &str) {
    stream
        .write_all(format!("{line}\n").as_bytes())
        .expect("send command");
}

/// Issue one request that carries no upload; returns the advisory name and
/// the result bytes.
pub fn request(stream: &mut TcpStream, line: &str) -> (String, Vec<u8>) {
    send_line(stream, line);
    let name = protocol::recv_message(stream).expect("solution name");
    let mut result = Vec::new();
    let len = transfer::recv(stream, &mut result).expect("result transfer");
    assert_eq!(len as usize, result.len());
    (name, result)
}

/// Send an unknown operation and check the server answers and hangs up.
pub fn expect_rejected(stream: &mut TcpStream, line: &str) {
    send_line(stream, line);
    assert_eq!(
        protocol::recv_message(stream).expect("error payload"),
        ERROR_PAYLOAD
    );
    let mut buf = [0u8; 1];
    assert_eq!(stream.read(&mut buf).expect("read after reject"), 0);
}

/// Split `<op>_client<N>_soln<M>.txt` into `(op, N, M)`.
pub fn parse_solution_name(name: &str) -> (String, u64, u64) {
    let stem = name.strip_suffix(".txt").expect("txt suffix");
    let (rest, soln) = stem.rsplit_once("_soln").expect("soln part");
    let (op, client) = rest.rsplit_once("_client").expect("client part");
    (
        op.to_string(),
        client.parse().expect("client number"),
        soln.parse().expect("solution number"),
    )
}

/// Two concurrent connections issuing three requests each must see their
/// own client id and solution numbers 1, 2, 3.
pub fn assert_independent_sessions(addr: SocketAddr) {
    let workers: Vec<_> = ["kmeans", "matinv"]
        .into_iter()
        .map(|op| {
            thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).expect("connect");
                (1..=3)
                    .map(|i| {
                        let (name, result) = request(&mut stream, &format!("{op} run{i}"));
                        assert_eq!(result, format!("{op} run{i}\n").into_bytes());
                        parse_solution_name(&name)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut clients = Vec::new();
    for (handle, op) in workers.into_iter().zip(["kmeans", "matinv"]) {
        let names = handle.join().expect("client thread");
        let client = names[0].1;
        for (i, (name_op, name_client, soln)) in names.into_iter().enumerate() {
            assert_eq!(name_op, op);
            assert_eq!(name_client, client);
            assert_eq!(soln, i as u64 + 1);
        }
        clients.push(client);
    }
    assert_ne!(clients[0], clients[1]);
}
