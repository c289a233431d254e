use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Lifecycle state of a task row.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    QUEUED_NO_DEP,
    RUNNING,
    FAILED,
    SUCCEEDED,
    CHECKPOINTED,
    KILLED,
    DELETED,
}

pub const ALL_TASK_STATES: [TaskState; 7] = [
    TaskState::QUEUED_NO_DEP,
    TaskState::RUNNING,
    TaskState::FAILED,
    TaskState::SUCCEEDED,
    TaskState::CHECKPOINTED,
    TaskState::DELETED,
    TaskState::KILLED,
];

/// Task states a `checkout()` with no explicit state filter will consider.
pub const CHECKOUT_ELIGIBLE_STATES: [TaskState; 3] =
    [TaskState::QUEUED_NO_DEP, TaskState::CHECKPOINTED, TaskState::KILLED];

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskState::QUEUED_NO_DEP => "QUEUED_NO_DEP",
            TaskState::RUNNING => "RUNNING",
            TaskState::FAILED => "FAILED",
            TaskState::SUCCEEDED => "SUCCEEDED",
            TaskState::CHECKPOINTED => "CHECKPOINTED",
            TaskState::KILLED => "KILLED",
            TaskState::DELETED => "DELETED",
        })
    }
}

impl FromStr for TaskState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED_NO_DEP" => Ok(TaskState::QUEUED_NO_DEP),
            "RUNNING" => Ok(TaskState::RUNNING),
            "FAILED" => Ok(TaskState::FAILED),
            "SUCCEEDED" => Ok(TaskState::SUCCEEDED),
            "CHECKPOINTED" => Ok(TaskState::CHECKPOINTED),
            "KILLED" => Ok(TaskState::KILLED),
            "DELETED" => Ok(TaskState::DELETED),
            other => Err(StoreError::InvalidArgument(format!(
                "'{other}' is not a valid task state"
            ))),
        }
    }
}

/// Action recorded on a log entry. Distinct from `TaskState`: a handful of
/// actions (RAN, RAN_FROM_CHECKPOINT, ADDED, RESET, UPDATED, CLEANED) have
/// no corresponding terminal task state.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogAction {
    ADDED,
    RAN,
    RAN_FROM_CHECKPOINT,
    DELETED,
    RESET,
    FAILED,
    SUCCEEDED,
    CHECKPOINTED,
    KILLED,
    UPDATED,
    CLEANED,
}

impl fmt::Display for LogAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogAction::ADDED => "ADDED",
            LogAction::RAN => "RAN",
            LogAction::RAN_FROM_CHECKPOINT => "RAN_FROM_CHECKPOINT",
            LogAction::DELETED => "DELETED",
            LogAction::RESET => "RESET",
            LogAction::FAILED => "FAILED",
            LogAction::SUCCEEDED => "SUCCEEDED",
            LogAction::CHECKPOINTED => "CHECKPOINTED",
            LogAction::KILLED => "KILLED",
            LogAction::UPDATED => "UPDATED",
            LogAction::CLEANED => "CLEANED",
        })
    }
}

impl FromStr for LogAction {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADDED" => Ok(LogAction::ADDED),
            "RAN" => Ok(LogAction::RAN),
            "RAN_FROM_CHECKPOINT" => Ok(LogAction::RAN_FROM_CHECKPOINT),
            "DELETED" => Ok(LogAction::DELETED),
            "RESET" => Ok(LogAction::RESET),
            "FAILED" => Ok(LogAction::FAILED),
            "SUCCEEDED" => Ok(LogAction::SUCCEEDED),
            "CHECKPOINTED" => Ok(LogAction::CHECKPOINTED),
            "KILLED" => Ok(LogAction::KILLED),
            "UPDATED" => Ok(LogAction::UPDATED),
            "CLEANED" => Ok(LogAction::CLEANED),
            other => Err(StoreError::IntegrityFailure(format!(
                "'{other}' is not a recognized log action"
            ))),
        }
    }
}

/// `checkin()` only ever transitions a task into one of these terminal (or
/// resumable) states.
pub const VALID_CHECKIN_ACTIONS: [LogAction; 4] = [
    LogAction::FAILED,
    LogAction::SUCCEEDED,
    LogAction::CHECKPOINTED,
    LogAction::KILLED,
];

/// The log actions that disqualify a RAN/SUCCEEDED pair from contributing a
/// runtime measurement if they occur in between (see `runtime()`).
pub const RUNTIME_RESET_ACTIONS: [LogAction; 5] = [
    LogAction::ADDED,
    LogAction::RESET,
    LogAction::DELETED,
    LogAction::KILLED,
    LogAction::UPDATED,
];

pub fn log_action_for_checkin(state: TaskState) -> Option<LogAction> {
    match state {
        TaskState::FAILED => Some(LogAction::FAILED),
        TaskState::SUCCEEDED => Some(LogAction::SUCCEEDED),
        TaskState::CHECKPOINTED => Some(LogAction::CHECKPOINTED),
        TaskState::KILLED => Some(LogAction::KILLED),
        _ => None,
    }
}

/// Global pause/run flag of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreState {
    RUNNING,
    PAUSED,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreState::RUNNING => "RUNNING",
            StoreState::PAUSED => "PAUSED",
        })
    }
}

impl FromStr for StoreState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(StoreState::RUNNING),
            "PAUSED" => Ok(StoreState::PAUSED),
            other => Err(StoreError::IntegrityFailure(format!(
                "'{other}' is not a valid store state"
            ))),
        }
    }
}
