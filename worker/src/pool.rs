use std::process::{Child, Command};
use std::time::{Duration, Instant};

use cake_store::{Store, StoreState, TaskState};

use crate::signal::Interrupt;
use crate::{print_task_end, print_task_start, Worker, WorkerConfig, WorkerResult};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct Slot {
    task_id: String,
    child: Child,
}

fn spawn_shell(cmd: &str) -> std::io::Result<Child> {
    Command::new("sh").arg("-c").arg(cmd).spawn()
}

/// A fixed pool of `n` OS-process execution slots, admitting and draining
/// tasks in two phases (the nearest stdlib equivalent of a bounded worker
/// pool, since each "slot" is a real child process rather than a thread).
pub struct LocalPoolWorker {
    store: Store,
    config: WorkerConfig,
    interrupt: Interrupt,
    n: usize,
}

impl LocalPoolWorker {
    pub fn new(store: Store, config: WorkerConfig, n: usize) -> Self {
        LocalPoolWorker {
            store,
            config,
            interrupt: Interrupt::new(),
            n,
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

    /// Poll every busy slot once; finished children are checked in and the
    /// slot is freed.
    fn poll_busy(&self, slots: &mut [Option<Slot>], silent: bool) -> WorkerResult<()> {
        for slot in slots.iter_mut() {
            let Some(s) = slot else { continue };
            match s.child.try_wait() {
                Ok(Some(status)) => {
                    let code = status.code().unwrap_or(1);
                    let outcome = if code == 0 {
                        TaskState::SUCCEEDED
                    } else {
                        TaskState::FAILED
                    };
                    let info = if code == 0 { String::new() } else { code.to_string() };
                    self.store.checkin(&s.task_id, outcome, &info)?;
                    print_task_end(&s.task_id, code, silent);
                    *slot = None;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(task_id = %s.task_id, error = %e, "wait on child failed");
                    self.store.checkin(&s.task_id, TaskState::FAILED, "wait failed")?;
                    *slot = None;
                }
            }
        }
        Ok(())
    }
}

impl Worker for LocalPoolWorker {
    fn run(&mut self, state: Option<TaskState>, silent: bool) -> WorkerResult<()> {
        self.interrupt.install()?;
        self.store.run()?;

        let start = Instant::now();
        let mut slots: Vec<Option<Slot>> = (0..self.n).map(|_| None).collect();
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

            let mut admitted_any = false;
            for slot in slots.iter_mut() {
                if slot.is_some() {
                    continue;
                }
                match self.store.checkout(state)? {
                    Some((cmd, id)) => {
                        print_task_start(&id, &cmd, silent);
                        let child = spawn_shell(&cmd).map_err(|e| {
                            cake_store::StoreError::IntegrityFailure(format!(
                                "failed to spawn '{cmd}': {e}"
                            ))
                        })?;
                        *slot = Some(Slot { task_id: id, child });
                        admitted_any = true;
                    }
                    None => break 'admit,
                }
            }

            self.poll_busy(&mut slots, silent)?;
            if !admitted_any {
                std::thread::sleep(POLL_INTERVAL);
            }
        }

        let drain_deadline = self.drain_deadline();
        while slots.iter().any(Option::is_some) {
            if self.interrupt.is_set() {
                break;
            }
            if let Some(deadline) = drain_deadline {
                if start.elapsed() >= deadline {
                    break;
                }
            }
            self.poll_busy(&mut slots, silent)?;
            std::thread::sleep(POLL_INTERVAL);
        }

        for slot in slots.iter_mut() {
            if let Some(s) = slot.take() {
                let _ = s.child.kill();
                let _ = s.child.wait();
                self.store.checkin(&s.task_id, TaskState::KILLED, "")?;
            }
        }

        Ok(())
    }

    fn close(self: Box<Self>) -> WorkerResult<()> {
        Ok(self.store.close()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cake_store::StoreConfig;
    use tempfile::tempdir;

    #[test]
    fn drains_all_tasks_across_the_pool() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.sqlite");
        let store = Store::open(&path, StoreConfig::default()).unwrap();
        let reader = Store::open(&path, StoreConfig::default()).unwrap();
        for i in 0..16 {
            reader.add(&format!("echo {i}"), None, None).unwrap();
        }

        let mut w = LocalPoolWorker::new(store, WorkerConfig::default(), 4);
        w.run(None, true).unwrap();

        let status = reader.status().unwrap();
        let succeeded = status
            .per_state
            .iter()
            .find(|(s, _)| *s == TaskState::SUCCEEDED)
            .unwrap()
            .1;
        assert_eq!(succeeded, 16);
    }

    #[test]
    fn zero_stoptime_kills_in_flight_tasks_at_runtime_boundary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.sqlite");
        let store = Store::open(&path, StoreConfig::default()).unwrap();
        let reader = Store::open(&path, StoreConfig::default()).unwrap();
        for i in 0..4 {
            reader
                .add(&format!("echo {i} && sleep 5"), None, None)
                .unwrap();
        }

        let config = WorkerConfig {
            runtime: Some(Duration::from_millis(200)),
            stoptime: Duration::ZERO,
            ..WorkerConfig::default()
        };
        let mut w = LocalPoolWorker::new(store, config, 4);
        w.run(None, true).unwrap();

        let status = reader.status().unwrap();
        let killed = status
            .per_state
            .iter()
            .find(|(s, _)| *s == TaskState::KILLED)
            .unwrap()
            .1;
        assert_eq!(killed, 4);
    }
}
