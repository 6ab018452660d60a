//! Per-group temp-dir lifecycle (spec §4.5 step 1/3): create
//! `/tmp/scr-<group>-<timestamp><rand>` mode 0700 lazily, clean it up when
//! the group finishes unless `--keep-temp-dirs` (or dry-run) was requested.

use crate::codec::ResolvedPath;
use crate::error::{Error, Result};
use crate::host::ProcessHost;

pub fn temp_dir_path(group: &str, datetime: &str, rand_suffix: &str) -> Result<ResolvedPath> {
    ResolvedPath::new(format!("/tmp/scr-{group}-{datetime}{rand_suffix}"))
}

/// Side-effect-free dry-run stand-in for a group's working directory
/// (spec §4.5, dry-run mode): deterministic, never created on disk.
pub fn dry_run_temp_dir_path(group: &str, synthetic: &str) -> Result<ResolvedPath> {
    ResolvedPath::new(format!("/dry-run/scr-{group}-{synthetic}"))
}

pub struct GroupTempDir {
    path: ResolvedPath,
    keep: bool,
}

impl GroupTempDir {
    pub fn create(path: ResolvedPath, host: &dyn ProcessHost, keep: bool) -> Result<Self> {
        host.create_private_dir(path.as_path()).map_err(|e| Error::Io { path: path.to_string(), source: e })?;
        Ok(Self { path, keep })
    }

    pub fn path(&self) -> &ResolvedPath {
        &self.path
    }

    /// Remove the temp dir unless `keep_temp_dirs` was requested. Safe to
    /// call once per group, on every exit path (success or failure).
    pub fn cleanup(&self, host: &dyn ProcessHost) -> Result<()> {
        if self.keep {
            return Ok(());
        }
        host.remove_dir_all(self.path.as_path()).map_err(|e| Error::Io { path: self.path.to_string(), source: e })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::FakeHost;

    #[test]
    fn creates_and_cleans_up_by_default() {
        let host = FakeHost::new();
        let path = temp_dir_path("build", "20260101_000000", "ab12").unwrap();
        assert_eq!(path.as_str(), "/tmp/scr-build-20260101_000000ab12");
        let dir = GroupTempDir::create(path.clone(), &host, false).unwrap();
        assert!(host.is_directory(dir.path().as_path()));
        dir.cleanup(&host).unwrap();
        assert!(!host.is_directory(path.as_path()));
    }

    #[test]
    fn keep_temp_dirs_skips_cleanup() {
        let host = FakeHost::new();
        let path = temp_dir_path("build", "20260101_000000", "ab12").unwrap();
        let dir = GroupTempDir::create(path.clone(), &host, true).unwrap();
        dir.cleanup(&host).unwrap();
        assert!(host.is_directory(path.as_path()));
    }

    #[test]
    fn dry_run_path_is_deterministic_and_never_materialized() {
        let path = dry_run_temp_dir_path("build", "1").unwrap();
        assert_eq!(path.as_str(), "/dry-run/scr-build-1");
    }
}
