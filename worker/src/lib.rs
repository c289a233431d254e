pub mod channel;
pub mod distributed;
pub mod pool;
pub mod serial;
pub mod signal;

use std::process::Command;
use std::time::Duration;

use cake_store::{Store, StoreConfig, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type WorkerResult<T> = Result<T, WorkerError>;

/// Shared tunables for every worker variant.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Total lifetime of the worker run. `None` means unbounded.
    pub runtime: Option<Duration>,
    /// Tail of `runtime` reserved for graceful drain.
    pub stoptime: Duration,
    /// Fraction of `stoptime` allotted to the final-drain sub-phase.
    pub left_frac: f64,
    pub store: StoreConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            runtime: None,
            stoptime: Duration::from_secs(300),
            left_frac: 0.5,
            store: StoreConfig::default(),
        }
    }
}

/// The capability set every worker variant implements: serial,
/// local-process-pool, and distributed all share this contract, selected by
/// the CLI at dispatch time.
pub trait Worker {
    fn run(&mut self, state: Option<cake_store::TaskState>, silent: bool) -> WorkerResult<()>;
    fn close(self: Box<Self>) -> WorkerResult<()>;
}

/// Construct a worker's Store handle from a path, applying the worker's
/// session overrides.
pub fn open_store(path: impl AsRef<std::path::Path>, config: StoreConfig) -> WorkerResult<Store> {
    Ok(Store::open(path, config)?)
}

/// Run `cmd` as a shell child and return its integer exit status.
/// Non-zero and signal-terminated both surface as a status; only the
/// integer is consumed, per the child-execution interface.
pub fn run_shell(cmd: &str) -> std::io::Result<i32> {
    let status = Command::new("sh").arg("-c").arg(cmd).status()?;
    Ok(status.code().unwrap_or(1))
}

fn print_start(id: &str, cmd: &str, silent: bool) {
    if !silent {
        println!("### running task {id}: {cmd}");
    }
}

fn print_end(id: &str, status: i32, silent: bool) {
    if !silent {
        println!("### task {id} finished with status {status}");
    }
}

pub(crate) use print_end as print_task_end;
pub(crate) use print_start as print_task_start;
