pub mod config;
pub mod ipc;
pub mod model;
pub mod protocol;
pub mod store;

pub use config::{HearthConfig, load_config};
pub use ipc::IpcCommand;
pub use model::{
    ContextMode, NewMessage, RegisteredGroup, ScheduleKind, ScheduledTask, TaskRunLog, TaskStatus,
};
pub use store::Store;
