//! # CLI - EventDB Interactive Shell
//!
//! A REPL-style command-line interface for the EventDB event log.
//! Reads commands from stdin, executes them against an open `EventLog`, and
//! prints results to stdout. Works interactively and with piped scripts.
//!
//! ## Commands
//!
//! ```text
//! APPEND type payload            Append a record to the log
//! CELL id type payload           Write the current value of a cell
//! ALLOC                          Reserve a fresh cell id
//! GETCELL id                     Print a cell (or "(nil)")
//! DUMP                           Print every log record
//! EXPORT file [from tbase]       Write a replication stream of the history
//! IMPORT file [offset tbase]     Apply a replication stream
//! STATS                          Print engine counters
//! EXIT / QUIT                    Shut down gracefully
//! ```
//!
//! ## Configuration
//!
//! Settings come from `EVENTDB_*` environment variables (see the `config`
//! crate), e.g. `EVENTDB_PATH`, `EVENTDB_SYNC`, `EVENTDB_SLAVE`.
//! Log verbosity follows `RUST_LOG` (default: `warn`); logs go to stderr.
//!
//! ## Example
//!
//! ```text
//! $ EVENTDB_PATH=data/events.log cargo run -p cli
//! EventDB started (path=data/events.log, blocks=0, cells=0, slave=false)
//! > APPEND 1 user signed up
//! OK offset=0
//! > DUMP
//! @0 t=1767225600 type=1 user signed up
//! (1 records)
//! > EXIT
//! bye
//! ```

mod shell;

use anyhow::{Context, Result};
use config::EventDbConfig;
use engine::EventLog;
use shell::{Flow, Shell};
use std::io::{self, BufRead, Write};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_tracing();

    let cfg = EventDbConfig::from_env();
    let db = EventLog::open(cfg.clone())
        .with_context(|| format!("failed to open {}", cfg.path.display()))?;

    let mut shell = Shell::new(db);
    let stats = shell.db().stats()?;
    println!(
        "EventDB started (path={}, blocks={}, cells={}, slave={})",
        cfg.path.display(),
        stats.write_pos,
        stats.cell_count,
        cfg.slave
    );
    println!("Commands: APPEND type payload | CELL id type payload | ALLOC | GETCELL id");
    println!("          DUMP | EXPORT file | IMPORT file | STATS | EXIT");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    print!("> ");
    stdout.flush().ok();

    for line in stdin.lock().lines() {
        let line = line?;
        if shell.execute(&line, &mut stdout)? == Flow::Exit {
            break;
        }
        print!("> ");
        stdout.flush().ok();
    }

    shell.close()
}
