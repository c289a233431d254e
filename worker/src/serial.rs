use std::time::Instant;

use cake_store::{Store, StoreState, TaskState};

use crate::signal::Interrupt;
use crate::{print_task_end, print_task_start, run_shell, Worker, WorkerConfig, WorkerResult};

/// Single-threaded execution loop: checkout, run, checkin, repeat.
pub struct SerialWorker {
    store: Store,
    config: WorkerConfig,
    interrupt: Interrupt,
}

impl SerialWorker {
    pub fn new(store: Store, config: WorkerConfig) -> Self {
        SerialWorker {
            store,
            config,
            interrupt: Interrupt::new(),
        }
    }
}

impl Worker for SerialWorker {
    fn run(&mut self, state: Option<TaskState>, silent: bool) -> WorkerResult<()> {
        self.interrupt.install()?;
        self.store.run()?;

        let start = Instant::now();
        // the task currently checked out, if any, so the interrupt handler's
        // poll point below can check it in as KILLED instead of abandoning it
        let mut in_flight: Option<String> = None;

        loop {
            if self.interrupt.is_set() {
                if let Some(id) = in_flight.take() {
                    tracing::warn!(task_id = %id, "interrupted while running, checking in as killed");
                    self.store.checkin(&id, TaskState::KILLED, "")?;
                }
                break;
            }
            if let Some(runtime) = self.config.runtime {
                if start.elapsed() >= runtime {
                    break;
                }
            }
            if self.store.state()? == StoreState::PAUSED {
                break;
            }

            let Some((cmd, id)) = self.store.checkout(state)? else {
                break;
            };
            in_flight = Some(id.clone());
            print_task_start(&id, &cmd, silent);

            let status = run_shell(&cmd).unwrap_or(1);

            if self.interrupt.is_set() {
                self.store.checkin(&id, TaskState::KILLED, "")?;
                in_flight = None;
                break;
            }

            let outcome = if status == 0 {
                TaskState::SUCCEEDED
            } else {
                TaskState::FAILED
            };
            let info = if status == 0 { String::new() } else { status.to_string() };
            self.store.checkin(&id, outcome, &info)?;
            in_flight = None;
            print_task_end(&id, status, silent);
        }

        Ok(())
    }

    fn close(self: Box<Self>) -> WorkerResult<()> {
        Ok(self.store.close()?)
    }
}
