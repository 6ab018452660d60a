//! scr - secure batch command runner
//!
//! Loads a declarative TOML manifest of command groups, verifies every
//! referenced file and executable against pre-recorded content hashes,
//! expands a scoped variable system, and executes commands with the
//! privileges and working-directory discipline the manifest specifies.

pub mod audit;
pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod exec;
pub mod expand;
pub mod host;
pub mod privilege;
pub mod risk;
pub mod verify;
pub mod workdir;

pub use codec::{decode, encode, EncodedName, HashStore, ResolvedPath};
pub use config::{load_config, CommandConfig, ConfigTree, GlobalConfig, GroupConfig};
pub use error::{Error, Result, Scope};
pub use host::{Clock, ProcessHost};
