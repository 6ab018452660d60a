//! C2: verification manager. Applies the C1 hash store to every file the
//! manifest references, and resolves `cmd` strings to absolute executable
//! paths under a fixed policy path.

use std::sync::Arc;

use serde::Serialize;

use crate::codec::{HashStore, ResolvedPath, VerifyOutcome};
use crate::error::{Error, Result, VerifyFailure};
use crate::host::ProcessHost;

/// Fixed policy path scanned, in order, for bare command names.
pub const POLICY_PATH: &[&str] = &[
    "/usr/local/sbin",
    "/usr/local/bin",
    "/usr/sbin",
    "/usr/bin",
    "/sbin",
    "/bin",
];

/// Resolve an expanded `cmd` string to an absolute path, per spec §4.2.
pub fn resolve_command_path(cmd: &str, host: &dyn ProcessHost) -> Result<ResolvedPath> {
    if cmd.starts_with('/') {
        return ResolvedPath::new(cmd);
    }
    if cmd.contains('/') {
        return Err(Error::BadCommandReference { cmd: cmd.to_string() });
    }
    for dir in POLICY_PATH {
        let candidate = format!("{dir}/{cmd}");
        let path = std::path::Path::new(&candidate);
        if host.path_exists(path) && host.is_executable_file(path) {
            return ResolvedPath::new(candidate);
        }
    }
    Err(Error::NotFound { cmd: cmd.to_string() })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationResult {
    Verified { path: String },
    Skipped { path: String, reason: String },
    Failed { path: String, reason: String },
}

impl VerificationResult {
    pub fn path(&self) -> &str {
        match self {
            VerificationResult::Verified { path }
            | VerificationResult::Skipped { path, .. }
            | VerificationResult::Failed { path, .. } => path,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, VerificationResult::Failed { .. })
    }
}

impl std::fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationResult::Verified { path } => write!(f, "verified {path}"),
            VerificationResult::Skipped { path, reason } => write!(f, "skipped {path} ({reason})"),
            VerificationResult::Failed { path, reason } => write!(f, "failed {path}: {reason}"),
        }
    }
}

fn outcome_to_result(path: &ResolvedPath, outcome: VerifyOutcome) -> VerificationResult {
    match outcome {
        VerifyOutcome::Ok => VerificationResult::Verified { path: path.to_string() },
        VerifyOutcome::Failed(reason) => VerificationResult::Failed {
            path: path.to_string(),
            reason: reason.to_string(),
        },
    }
}

pub struct VerificationManager {
    store: HashStore,
    host: Arc<dyn ProcessHost>,
    verify_standard_paths: bool,
}

impl VerificationManager {
    pub fn new(store: HashStore, host: Arc<dyn ProcessHost>, verify_standard_paths: bool) -> Self {
        Self { store, host, verify_standard_paths }
    }

    /// Verify a single file, recording the outcome rather than failing
    /// immediately — callers decide whether a `Failed` result aborts the run
    /// (normal mode) or is merely reported (dry-run mode).
    pub fn verify_file(&self, path: &ResolvedPath) -> VerificationResult {
        outcome_to_result(path, self.store.verify(path))
    }

    pub fn verify_many<'a>(&self, paths: impl IntoIterator<Item = &'a ResolvedPath>) -> Vec<VerificationResult> {
        paths.into_iter().map(|p| self.verify_file(p)).collect()
    }

    /// Resolve and verify a command's executable path.
    pub fn verify_command(&self, cmd: &str) -> (Option<ResolvedPath>, VerificationResult) {
        match resolve_command_path(cmd, self.host.as_ref()) {
            Ok(path) => {
                let result = self.verify_file(&path);
                (Some(path), result)
            }
            Err(e) => (
                None,
                VerificationResult::Failed {
                    path: cmd.to_string(),
                    reason: format!("{e}"),
                },
            ),
        }
    }

    /// Verify every executable the resolver can return from the policy
    /// path (spec §4.2(d)), if `verify_standard_paths` is enabled.
    pub fn verify_standard_paths(&self) -> Vec<VerificationResult> {
        if !self.verify_standard_paths {
            return vec![VerificationResult::Skipped {
                path: "<standard paths>".to_string(),
                reason: "verify_standard_paths = false".to_string(),
            }];
        }
        let mut results = Vec::new();
        for dir in POLICY_PATH {
            let dir_path = std::path::Path::new(dir);
            if !self.host.is_directory(dir_path) {
                continue;
            }
            for exe in self.host.list_executables(dir_path) {
                match ResolvedPath::new(&exe) {
                    Ok(path) => results.push(self.verify_file(&path)),
                    Err(e) => results.push(VerificationResult::Failed {
                        path: exe.to_string_lossy().to_string(),
                        reason: format!("{e}"),
                    }),
                }
            }
        }
        results
    }

    pub fn hash_dir(&self) -> &ResolvedPath {
        self.store.hash_dir()
    }
}

/// Convert a list of verification results into a single fatal error if any
/// failed, per the normal-execution propagation policy (spec §4.2: "In
/// normal execution any `Failed` is fatal before command launch").
pub fn require_all_verified(results: &[VerificationResult]) -> Result<()> {
    if let Some(failed) = results.iter().find(|r| r.is_failed()) {
        if let VerificationResult::Failed { path, reason } = failed {
            let kind = match reason.as_str() {
                s if s.contains("hash record missing") => VerifyFailure::HashMissing,
                s if s.contains("hash mismatch") => VerifyFailure::Mismatch,
                s if s.contains("i/o error") => VerifyFailure::Io,
                s if s.contains("policy denied") => VerifyFailure::PolicyDenied,
                _ => VerifyFailure::BadPath,
            };
            return Err(match kind {
                VerifyFailure::HashMissing => Error::HashMissing {
                    path: path.clone(),
                    hash_dir: String::new(),
                },
                VerifyFailure::Mismatch => Error::HashMismatch {
                    path: path.clone(),
                    expected: "recorded digest".into(),
                    actual: "computed digest".into(),
                },
                _ => Error::PolicyDenied {
                    path: path.clone(),
                    reason: reason.clone(),
                },
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::FakeHost;
    use sha2::{Digest, Sha256};

    fn record_json(content: &[u8]) -> Vec<u8> {
        serde_json::to_vec(&crate::codec::HashRecord {
            algorithm: "sha256".into(),
            digest: format!("{:x}", Sha256::digest(content)),
        })
        .unwrap()
    }

    #[test]
    fn resolve_absolute_cmd() {
        let host = FakeHost::new();
        let resolved = resolve_command_path("/usr/bin/env", &host).unwrap();
        assert_eq!(resolved.as_str(), "/usr/bin/env");
    }

    #[test]
    fn relative_cmd_with_slash_is_bad_reference() {
        let host = FakeHost::new();
        let err = resolve_command_path("./foo", &host).unwrap_err();
        assert!(matches!(err, Error::BadCommandReference { .. }));
    }

    #[test]
    fn bare_name_scans_policy_path_in_order() {
        let host = FakeHost::new().with_executable("/usr/bin/true");
        let resolved = resolve_command_path("true", &host).unwrap();
        assert_eq!(resolved.as_str(), "/usr/bin/true");
    }

    #[test]
    fn bare_name_not_found_anywhere() {
        let host = FakeHost::new();
        let err = resolve_command_path("nonexistent-tool", &host).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn verify_command_end_to_end() {
        let host = Arc::new(
            FakeHost::new()
                .with_executable("/usr/bin/true")
                .with_file("/hashes/~usr~bin~true", &record_json(b"")),
        );
        let store = HashStore::new(ResolvedPath::new("/hashes").unwrap(), host.clone());
        let manager = VerificationManager::new(store, host, true);
        let (path, result) = manager.verify_command("true");
        assert!(path.is_some());
        assert!(matches!(result, VerificationResult::Verified { .. }));
    }

    #[test]
    fn verify_standard_paths_enumerates_policy_directories() {
        let host = FakeHost::new()
            .with_executable("/usr/bin/true")
            .with_file("/hashes/~usr~bin~true", &record_json(b""));
        host.create_dir_all(std::path::Path::new("/usr/bin")).unwrap();
        let host = Arc::new(host);
        let store = HashStore::new(ResolvedPath::new("/hashes").unwrap(), host.clone());
        let manager = VerificationManager::new(store, host, true);
        let results = manager.verify_standard_paths();
        assert!(results
            .iter()
            .any(|r| matches!(r, VerificationResult::Verified { path } if path == "/usr/bin/true")));
    }

    #[test]
    fn verify_standard_paths_flags_unhashed_binary() {
        let host = FakeHost::new().with_executable("/usr/bin/true");
        host.create_dir_all(std::path::Path::new("/usr/bin")).unwrap();
        let host = Arc::new(host);
        let store = HashStore::new(ResolvedPath::new("/hashes").unwrap(), host.clone());
        let manager = VerificationManager::new(store, host, true);
        let results = manager.verify_standard_paths();
        assert!(results.iter().any(|r| r.is_failed()));
    }

    #[test]
    fn verify_standard_paths_skipped_when_disabled() {
        let host = Arc::new(FakeHost::new());
        let store = HashStore::new(ResolvedPath::new("/hashes").unwrap(), host.clone());
        let manager = VerificationManager::new(store, host, false);
        let results = manager.verify_standard_paths();
        assert_eq!(results.len(), 1);
        assert!(matches!(&results[0], VerificationResult::Skipped { .. }));
    }

    #[test]
    fn require_all_verified_passes_when_all_ok() {
        let results = vec![VerificationResult::Verified { path: "/a".into() }];
        assert!(require_all_verified(&results).is_ok());
    }

    #[test]
    fn require_all_verified_fails_on_any_failure() {
        let results = vec![
            VerificationResult::Verified { path: "/a".into() },
            VerificationResult::Failed { path: "/b".into(), reason: "hash mismatch".into() },
        ];
        assert!(require_all_verified(&results).is_err());
    }
}
