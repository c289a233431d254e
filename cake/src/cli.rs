use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use cake_store::{Store, StoreConfig, TaskState};
use cake_worker::channel::mpsc_network;
use cake_worker::distributed::{DistributedWorker, Master};
use cake_worker::pool::LocalPoolWorker;
use cake_worker::serial::SerialWorker;
use cake_worker::signal::Interrupt;
use cake_worker::{Worker, WorkerConfig};

#[derive(Parser)]
#[command(name = "cake", version, about = "A persistent shell task queue and worker runtime")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run until the queue drains, the store pauses, or time runs out.
    Run(RunArgs),
    /// Equivalent to `run --state failed`.
    Retry(RunArgs),
    /// Print tasks sorted by descending priority.
    List(ListArgs),
    /// Add one or more tasks.
    Add(AddArgs),
    /// Delete a task, logically (default) or physically (`--remove`).
    Delete(DeleteArgs),
    /// Field-wise update of a task.
    Update(UpdateArgs),
    /// Dump a task's header and chronological log.
    Log(TaskIdArgs),
    /// Print store state, client count, and per-state task counts.
    Status(DbArgs),
    /// Requeue every non-deleted task and drop other clients.
    Reset(DbArgs),
    /// Aggregated runtime report over succeeded tasks.
    Runtime(DbArgs),
    /// Print RUNNING or PAUSED.
    State(DbArgs),
    /// Set the store to PAUSED.
    Pause(DbArgs),
    /// Mark stranded RUNNING tasks KILLED after an ungraceful exit.
    Cleanup(DbArgs),
}

#[derive(clap::Args)]
pub struct DbArgs {
    pub db: PathBuf,
}

#[derive(clap::Args)]
pub struct RunArgs {
    pub db: PathBuf,
    #[arg(long)]
    pub state: Option<String>,
    #[arg(long)]
    pub runtime: Option<f64>,
    #[arg(long)]
    pub timeout: Option<f64>,
    #[arg(long)]
    pub task_checkout_delay: Option<f64>,
    #[arg(long)]
    pub task_checkout_num_tries: Option<u32>,
    #[arg(short = 'n')]
    pub pool_size: Option<usize>,
    #[arg(long)]
    pub mpi: bool,
    #[arg(long)]
    pub spawn_master: bool,
    #[arg(long)]
    pub stoptime: Option<f64>,
    #[arg(long)]
    pub silent: bool,
}

#[derive(clap::Args)]
pub struct ListArgs {
    pub db: PathBuf,
    #[arg(long)]
    pub state: Option<String>,
    #[arg(long)]
    pub with_runtime: bool,
}

#[derive(clap::Args)]
pub struct AddArgs {
    pub db: PathBuf,
    pub cmd: Vec<String>,
    #[arg(long)]
    pub file: Option<PathBuf>,
    #[arg(long)]
    pub task_id: Option<String>,
    #[arg(long)]
    pub priority: Option<f64>,
}

#[derive(clap::Args)]
pub struct DeleteArgs {
    pub db: PathBuf,
    pub task_id: String,
    #[arg(long)]
    pub remove: bool,
}

#[derive(clap::Args)]
pub struct UpdateArgs {
    pub db: PathBuf,
    pub task_id: String,
    #[arg(long)]
    pub state: Option<String>,
    #[arg(long)]
    pub task: Option<String>,
    #[arg(long)]
    pub priority: Option<f64>,
}

#[derive(clap::Args)]
pub struct TaskIdArgs {
    pub db: PathBuf,
    pub task_id: String,
}

fn store_config(
    timeout: Option<f64>,
    task_checkout_delay: Option<f64>,
    task_checkout_num_tries: Option<u32>,
) -> StoreConfig {
    let defaults = StoreConfig::default();
    StoreConfig {
        timeout: timeout.unwrap_or(defaults.timeout),
        task_checkout_delay: task_checkout_delay.unwrap_or(defaults.task_checkout_delay),
        task_checkout_num_tries: task_checkout_num_tries.unwrap_or(defaults.task_checkout_num_tries),
    }
}

fn worker_config(args: &RunArgs) -> WorkerConfig {
    let defaults = WorkerConfig::default();
    WorkerConfig {
        runtime: args.runtime.map(Duration::from_secs_f64),
        stoptime: args.stoptime.map(Duration::from_secs_f64).unwrap_or(defaults.stoptime),
        left_frac: defaults.left_frac,
        store: store_config(args.timeout, args.task_checkout_delay, args.task_checkout_num_tries),
    }
}

pub fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => run(args, None),
        Command::Retry(args) => run(args, Some(TaskState::FAILED)),
        Command::List(args) => list(args),
        Command::Add(args) => add(args),
        Command::Delete(args) => delete(args),
        Command::Update(args) => update(args),
        Command::Log(args) => log(args),
        Command::Status(args) => status(args),
        Command::Reset(args) => reset(args),
        Command::Runtime(args) => runtime_report(args),
        Command::State(args) => state(args),
        Command::Pause(args) => pause(args),
        Command::Cleanup(args) => cleanup(args),
    }
}

fn run(args: RunArgs, default_state: Option<TaskState>) -> Result<()> {
    let state = match &args.state {
        Some(s) => Some(Store::validate_state(s)?),
        None => default_state,
    };
    let silent = args.silent;
    let config = worker_config(&args);
    let store_cfg = config.store;

    if args.mpi || args.spawn_master {
        // two in-process ranks: rank 0 is the master, rank 1 a single
        // distributed worker; a real deployment plugs in an MPI- or
        // socket-backed `Channel` instead of the in-process one. `ctrlc`
        // allows only one handler per process, so one `Interrupt` is
        // installed here and shared by both ranks.
        let store = Store::open(&args.db, store_cfg)?;
        let mut net = mpsc_network(2);
        let worker_end = net.pop().unwrap();
        let master_end = net.pop().unwrap();

        let interrupt = Interrupt::new();
        interrupt.install()?;

        let worker_interrupt = interrupt.clone();
        let worker_handle = std::thread::spawn(move || {
            let mut w = DistributedWorker::new(worker_end, 0, worker_interrupt);
            let _ = w.run();
        });

        let mut master = Master::new(store, config, master_end, vec![1], interrupt);
        master.run(state, silent)?;
        Box::new(master).close()?;
        let _ = worker_handle.join();
        return Ok(());
    }

    let store = Store::open(&args.db, store_cfg)?;
    if let Some(n) = args.pool_size {
        let mut w = LocalPoolWorker::new(store, config, n);
        w.run(state, silent)?;
        Box::new(w).close()?;
    } else {
        let mut w = SerialWorker::new(store, config);
        w.run(state, silent)?;
        Box::new(w).close()?;
    }
    Ok(())
}

fn list(args: ListArgs) -> Result<()> {
    let store = Store::open(&args.db, StoreConfig::default())?;
    let state = args.state.as_deref().map(Store::validate_state).transpose()?;
    let tasks = store.list(state)?;
    for t in &tasks {
        println!("{}\t{}\t{:.2}\t{}", t.task_id, t.state, t.priority, t.cmd);
    }
    if args.with_runtime {
        let report = store.runtime()?;
        println!(
            "--- runtime: total {:.3}s over {} succeeded task(s), mean {:.3}s",
            report.total_seconds, report.num_succeeded, report.mean_seconds
        );
    }
    store.close()?;
    Ok(())
}

/// The `add` command resolves exactly one source of commands in this
/// order: positional arguments, then `--file`, then piped stdin.
fn resolve_cmds(args: &AddArgs) -> Result<Vec<String>> {
    if !args.cmd.is_empty() {
        return Ok(vec![args.cmd.join(" ")]);
    }
    if let Some(path) = &args.file {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let cmds: Vec<String> = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        if !cmds.is_empty() {
            return Ok(cmds);
        }
    }
    if !is_stdin_tty() {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        let cmds: Vec<String> = buf
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        if !cmds.is_empty() {
            return Ok(cmds);
        }
    }
    bail!("no command given: pass it as an argument, via --file, or on stdin")
}

fn is_stdin_tty() -> bool {
    use std::io::IsTerminal;
    std::io::stdin().is_terminal()
}

fn add(args: AddArgs) -> Result<()> {
    let cmds = resolve_cmds(&args)?;
    let store = Store::open(&args.db, StoreConfig::default())?;

    let ids = if cmds.len() == 1 {
        vec![store.add(&cmds[0], args.task_id.clone(), args.priority)?]
    } else {
        store.add_multiple(&cmds, None, args.priority.unwrap_or(0.0))?
    };
    for id in &ids {
        println!("{id}");
    }
    store.close()?;
    Ok(())
}

fn delete(args: DeleteArgs) -> Result<()> {
    let store = Store::open(&args.db, StoreConfig::default())?;
    store.delete(&args.task_id, args.remove)?;
    store.close()?;
    Ok(())
}

fn update(args: UpdateArgs) -> Result<()> {
    let store = Store::open(&args.db, StoreConfig::default())?;
    let state = args.state.as_deref().map(TaskState::from_str).transpose()?;
    store.update(&args.task_id, args.task.as_deref(), args.priority, state)?;
    store.close()?;
    Ok(())
}

fn log(args: TaskIdArgs) -> Result<()> {
    let store = Store::open(&args.db, StoreConfig::default())?;
    let (task, logs) = store.log(&args.task_id)?;
    println!("{}\t{}\t{:.2}\t{}", task.task_id, task.state, task.priority, task.cmd);
    for entry in &logs {
        println!("{}\t{}\t{}\t{}", entry.log_id, entry.time, entry.action, entry.info);
    }
    store.close()?;
    Ok(())
}

fn status(args: DbArgs) -> Result<()> {
    let store = Store::open(&args.db, StoreConfig::default())?;
    let report = store.status()?;
    println!("STATE: {}", report.state);
    println!("CLIENTS: {}", report.num_clients);
    println!("TASKS: {}", report.num_tasks);
    for (state, count) in &report.per_state {
        println!("{state}: {count}");
    }
    store.close()?;
    Ok(())
}

fn reset(args: DbArgs) -> Result<()> {
    let store = Store::open(&args.db, StoreConfig::default())?;
    store.reset()?;
    store.close()?;
    Ok(())
}

fn runtime_report(args: DbArgs) -> Result<()> {
    let store = Store::open(&args.db, StoreConfig::default())?;
    let report = store.runtime()?;
    println!("total: {:.3}s", report.total_seconds);
    println!("count: {}", report.num_succeeded);
    println!("mean: {:.3}s", report.mean_seconds);
    if let Some((id, secs)) = &report.min {
        println!("min: {secs:.3}s ({id})");
    }
    if let Some((id, secs)) = &report.max {
        println!("max: {secs:.3}s ({id})");
    }
    store.close()?;
    Ok(())
}

fn state(args: DbArgs) -> Result<()> {
    let store = Store::open(&args.db, StoreConfig::default())?;
    println!("{}", store.state()?);
    store.close()?;
    Ok(())
}

fn pause(args: DbArgs) -> Result<()> {
    let store = Store::open(&args.db, StoreConfig::default())?;
    store.pause()?;
    store.close()?;
    Ok(())
}

fn cleanup(args: DbArgs) -> Result<()> {
    let store = Store::open(&args.db, StoreConfig::default())?;
    store.cleanup()?;
    store.close()?;
    Ok(())
}
