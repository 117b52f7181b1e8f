//! Hearth daemon: routes chat messages to per-group agent sandboxes, runs
//! scheduled tasks, and services the sandboxes' filesystem IPC.

pub mod channel;
pub mod context;
pub mod http;
pub mod ipc;
pub mod mailbox;
pub mod message_loop;
pub mod process_group;
pub mod queue;
pub mod registry;
pub mod router;
pub mod sandbox;
pub mod schedule;
pub mod scheduler;
pub mod scheduler_wiring;
