//! Manifest loading: raw TOML shape (`raw`), the frozen configuration tree
//! (`tree`), and the loader that expands and verifies it (`loader`).

pub mod loader;
pub mod raw;
pub mod tree;

pub use loader::{load_config, LoadedConfig};
pub use tree::{CommandConfig, ConfigTree, GlobalConfig, GroupConfig, Timeout};
