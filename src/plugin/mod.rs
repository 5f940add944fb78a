pub mod control;
pub mod registration;
pub mod restart;
pub mod runner;

pub use control::{Control, ControlOptions, PluginRecord, PluginState};
pub use registration::{Registered, Registration};
pub use restart::RestartPolicy;
pub use runner::{CmdRunner, CmdRunnerFactory, OnStop, Runner, RunnerFactory};
