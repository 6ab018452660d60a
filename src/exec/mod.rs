//! C5: execution assembler and runner (spec §4.5).

pub mod capture;
pub mod command;
pub mod dryrun;
pub mod env_builder;
pub mod group;
pub mod timeout;

pub use capture::CaptureBuffer;
pub use command::{run_command, CancelState, CommandEnv, CommandOutcome};
pub use dryrun::{run_dry_run, DryRunCommand, DryRunDetail, DryRunFormat, DryRunGroup, DryRunReport};
pub use env_builder::build_child_env;
pub use group::{dry_run_temp_dir_path, temp_dir_path, GroupTempDir};
pub use timeout::{resolve as resolve_timeout, EffectiveTimeout};
