pub mod error;
pub mod lock;
pub mod sqlite;
pub mod state;
pub mod time;

pub use error::{StoreError, StoreResult};
pub use sqlite::{RuntimeReport, Store, StoreConfig, StatusReport, TaskRow, LogRow};
pub use state::{LogAction, StoreState, TaskState};
