use std::time::{Duration, Instant};

use cake_store::{Store, StoreState, TaskState};

use crate::channel::{Channel, Message};
use crate::signal::Interrupt;
use crate::{print_task_end, print_task_start, run_shell, Worker, WorkerConfig, WorkerResult};

struct InFlightEntry {
    worker: usize,
    task_id: String,
}

/// Rank 0: the sole writer to the Store. Dispatches work to ready workers
/// and reconciles their results; never executes a command itself.
pub struct Master<C: Channel> {
    store: Store,
    config: WorkerConfig,
    interrupt: Interrupt,
    channel: C,
    worker_ranks: Vec<usize>,
}

impl<C: Channel> Master<C> {
    /// `interrupt` is shared with the worker ranks running in this process;
    /// `ctrlc` allows only one handler per process, so the caller installs it
    /// once and hands the same handle to every role instead of each one
    /// calling `install()` for itself.
    pub fn new(store: Store, config: WorkerConfig, channel: C, worker_ranks: Vec<usize>, interrupt: Interrupt) -> Self {
        Master {
            store,
            config,
            interrupt,
            channel,
            worker_ranks,
        }
    }

    fn admit_deadline(&self) -> Option<Duration> {
        self.config
            .runtime
            .map(|r| r.checked_sub(self.config.stoptime).unwrap_or_default())
    }

    fn drain_deadline(&self) -> Option<Duration> {
        self.config.runtime.map(|r| {
            let reserved =
                Duration::from_secs_f64(self.config.stoptime.as_secs_f64() * self.config.left_frac);
            r.checked_sub(reserved).unwrap_or_default()
        })
    }

    fn checkin_result(
        &self,
        in_flight: &mut Vec<InFlightEntry>,
        id: &str,
        status: i32,
        silent: bool,
    ) -> WorkerResult<()> {
        in_flight.retain(|e| e.task_id != id);
        let outcome = if status == 0 {
            TaskState::SUCCEEDED
        } else {
            TaskState::FAILED
        };
        let info = if status == 0 { String::new() } else { status.to_string() };
        self.store.checkin(id, outcome, &info)?;
        print_task_end(id, status, silent);
        Ok(())
    }
}

impl<C: Channel> Worker for Master<C> {
    fn run(&mut self, state: Option<TaskState>, silent: bool) -> WorkerResult<()> {
        self.store.run()?;

        let start = Instant::now();
        let mut in_flight: Vec<InFlightEntry> = Vec::new();
        let admit_deadline = self.admit_deadline();

        'admit: loop {
            if self.interrupt.is_set() {
                break;
            }
            if let Some(deadline) = admit_deadline {
                if start.elapsed() >= deadline {
                    break;
                }
            }
            if self.store.state()? == StoreState::PAUSED {
                break;
            }

            let Some((from, msg)) = self.channel.try_recv_any()? else {
                continue;
            };
            match msg {
                Message::ReadyWorker => match self.store.checkout(state)? {
                    Some((cmd, id)) => {
                        print_task_start(&id, &cmd, silent);
                        in_flight.push(InFlightEntry {
                            worker: from,
                            task_id: id.clone(),
                        });
                        self.channel.send(from, Message::RecvWork { cmd, id })?;
                    }
                    None => break 'admit,
                },
                Message::ResultsWorker { status, id } => {
                    self.checkin_result(&mut in_flight, &id, status, silent)?;
                }
                Message::KilledWorker => {
                    in_flight.retain(|e| e.worker != from);
                }
                _ => {}
            }
        }

        let drain_deadline = self.drain_deadline();
        while !in_flight.is_empty() {
            if self.interrupt.is_set() {
                break;
            }
            if let Some(deadline) = drain_deadline {
                if start.elapsed() >= deadline {
                    break;
                }
            }
            if let Some((from, msg)) = self.channel.try_recv_any()? {
                match msg {
                    Message::ResultsWorker { status, id } => {
                        self.checkin_result(&mut in_flight, &id, status, silent)?;
                    }
                    Message::KilledWorker => {
                        in_flight.retain(|e| e.worker != from);
                    }
                    _ => {}
                }
            }
        }

        for &rank in &self.worker_ranks {
            let _ = self.channel.send(rank, Message::StopWork);
        }

        for entry in in_flight.drain(..) {
            tracing::warn!(task_id = %entry.task_id, worker = entry.worker, "draining worker, checking in as killed");
            self.store.checkin(&entry.task_id, TaskState::KILLED, "")?;
        }

        Ok(())
    }

    fn close(self: Box<Self>) -> WorkerResult<()> {
        Ok(self.store.close()?)
    }
}

/// A non-zero rank: executes whatever the master hands it and never touches
/// the Store.
pub struct DistributedWorker<C: Channel> {
    channel: C,
    master_rank: usize,
    interrupt: Interrupt,
}

impl<C: Channel> DistributedWorker<C> {
    /// `interrupt` is the same handle installed once by the process that
    /// owns this rank (see `Master::new`); this role never installs its own
    /// handler.
    pub fn new(channel: C, master_rank: usize, interrupt: Interrupt) -> Self {
        DistributedWorker {
            channel,
            master_rank,
            interrupt,
        }
    }

    pub fn run(&mut self) -> WorkerResult<()> {
        loop {
            if self.interrupt.is_set() {
                let _ = self.channel.send(self.master_rank, Message::KilledWorker);
                return Ok(());
            }

            self.channel.send(self.master_rank, Message::ReadyWorker)?;
            match self.channel.recv_from(self.master_rank)? {
                Message::StopWork => return Ok(()),
                Message::RecvWork { cmd, id } => {
                    let status = run_shell(&cmd).unwrap_or(1);
                    self.channel
                        .send(self.master_rank, Message::ResultsWorker { status, id })?;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mpsc_network;
    use cake_store::StoreConfig;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn master_and_one_worker_drain_the_queue() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.sqlite");
        let store = Store::open(&path, StoreConfig::default()).unwrap();
        let reader = Store::open(&path, StoreConfig::default()).unwrap();
        for i in 0..6 {
            reader.add(&format!("echo {i}"), None, None).unwrap();
        }

        let mut net = mpsc_network(2);
        let worker_end = net.pop().unwrap();
        let master_end = net.pop().unwrap();

        let interrupt = Interrupt::new();
        let worker_interrupt = interrupt.clone();
        let worker_handle = thread::spawn(move || {
            let mut w = DistributedWorker::new(worker_end, 0, worker_interrupt);
            w.run().unwrap();
        });

        let mut master = Master::new(store, WorkerConfig::default(), master_end, vec![1], interrupt);
        master.run(None, true).unwrap();
        worker_handle.join().unwrap();

        let status = reader.status().unwrap();
        let succeeded = status
            .per_state
            .iter()
            .find(|(s, _)| *s == TaskState::SUCCEEDED)
            .unwrap()
            .1;
        assert_eq!(succeeded, 6);
    }
}
