pub mod mounts;
pub mod policy;
pub mod process;
pub mod runner;
pub mod secrets;

pub use mounts::{HostPaths, MountPlan, plan_mounts, prepare_group_dirs};
pub use policy::{MountAllowlist, MountError};
pub use process::{DockerSpawner, ProcessHandle, SandboxProcess, SandboxSpawner, SpawnRequest};
pub use runner::{
    Invocation, RunHooks, RunOutcome, RunnerConfig, SandboxError, SandboxHandle, SandboxRunner,
};
pub use secrets::SecretBundle;
