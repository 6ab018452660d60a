//! C1: the filename codec and content-addressed hash store.
//!
//! Maps a resolved absolute path to a filename inside `hash_dir`. Normal
//! encoding is a substitute + double-escape pass that is invertible as long
//! as the result fits in `MAX_NAME` bytes; otherwise we fall back to a
//! SHA-256-derived name that cannot be decoded back to the original path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result, VerifyFailure};
use crate::host::ProcessHost;

pub const MAX_NAME: usize = 250;
pub const HASH_LEN: usize = 12;

/// An absolute, lexically-normalized path. Constructing one is the only way
/// to get a value that C1/C2/C4/C5 APIs accept, so "is this path resolved"
/// stops being a runtime question repeated at every call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolvedPath(PathBuf);

impl ResolvedPath {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = path.to_str().ok_or_else(|| Error::InvalidPath {
            path: path.to_string_lossy().to_string(),
            reason: "not valid UTF-8".into(),
        })?;
        if s.is_empty() {
            return Err(Error::InvalidPath {
                path: s.to_string(),
                reason: "empty path".into(),
            });
        }
        if !path.is_absolute() {
            return Err(Error::InvalidPath {
                path: s.to_string(),
                reason: "not absolute".into(),
            });
        }
        let normalized = normalize(s)?;
        Ok(Self(PathBuf::from(normalized)))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.to_str().expect("constructed from valid UTF-8")
    }

    pub fn join(&self, segment: &str) -> ResolvedPath {
        ResolvedPath(self.0.join(segment))
    }
}

impl std::fmt::Display for ResolvedPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lexically normalize an absolute path: collapse `.`/empty segments, reject
/// `..` (a programming error per the data model, not something we silently
/// resolve), and strip a trailing slash except for the root itself.
fn normalize(s: &str) -> Result<String> {
    let mut out_segments: Vec<&str> = Vec::new();
    for seg in s.split('/') {
        match seg {
            "" | "." => continue,
            ".." => {
                return Err(Error::InvalidPath {
                    path: s.to_string(),
                    reason: "'..' segments are not allowed in a resolved path".into(),
                })
            }
            other => out_segments.push(other),
        }
    }
    if out_segments.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(format!("/{}", out_segments.join("/")))
    }
}

/// Single scan that both substitutes `/` and double-escapes the two
/// characters that would otherwise be ambiguous (`~` and `#`).
fn substitute_and_escape(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 8);
    for ch in path.chars() {
        match ch {
            '/' => out.push('~'),
            '~' => out.push_str("##"),
            '#' => out.push_str("#1"),
            other => out.push(other),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedName {
    Normal(String),
    Fallback(String),
}

impl EncodedName {
    pub fn as_str(&self) -> &str {
        match self {
            EncodedName::Normal(s) => s,
            EncodedName::Fallback(s) => s,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, EncodedName::Fallback(_))
    }
}

/// Encode a resolved path to its on-disk hash record filename.
pub fn encode(path: &ResolvedPath) -> EncodedName {
    let normal = substitute_and_escape(path.as_str());
    if normal.len() <= MAX_NAME {
        EncodedName::Normal(normal)
    } else {
        use base64::Engine;
        let digest = Sha256::digest(path.as_str().as_bytes());
        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
        let truncated: String = b64.chars().take(HASH_LEN).collect();
        EncodedName::Fallback(format!("{truncated}.json"))
    }
}

/// Decode a normal-encoded filename back to the original resolved path.
/// Fails with `FallbackNotReversible` for anything not starting with `~`.
pub fn decode(encoded: &str) -> Result<ResolvedPath> {
    if !encoded.starts_with('~') {
        return Err(Error::FallbackNotReversible {
            name: encoded.to_string(),
        });
    }
    let mut out = String::with_capacity(encoded.len());
    let chars: Vec<char> = encoded.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '#' && i + 1 < chars.len() && chars[i + 1] == '#' {
            out.push('~');
            i += 2;
        } else if c == '#' && i + 1 < chars.len() && chars[i + 1] == '1' {
            out.push('#');
            i += 2;
        } else if c == '~' {
            out.push('/');
            i += 1;
        } else {
            out.push(c);
            i += 1;
        }
    }
    ResolvedPath::new(out)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashRecord {
    pub algorithm: String,
    pub digest: String,
}

/// Outcome of verifying a single file against its hash record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Ok,
    Failed(VerifyFailure),
}

/// Read-only, content-addressed hash store. The core never writes records;
/// they are produced offline by the hash-recorder (out of scope, see spec §1).
pub struct HashStore {
    hash_dir: ResolvedPath,
    host: Arc<dyn ProcessHost>,
}

impl HashStore {
    pub fn new(hash_dir: ResolvedPath, host: Arc<dyn ProcessHost>) -> Self {
        Self { hash_dir, host }
    }

    pub fn hash_dir(&self) -> &ResolvedPath {
        &self.hash_dir
    }

    fn record_path(&self, path: &ResolvedPath) -> PathBuf {
        self.hash_dir.as_path().join(encode(path).as_str())
    }

    fn read_record(&self, path: &ResolvedPath) -> Result<HashRecord> {
        let record_path = self.record_path(path);
        let bytes = self.host.read_file(&record_path).map_err(|_| Error::HashMissing {
            path: path.to_string(),
            hash_dir: self.hash_dir.to_string(),
        })?;
        serde_json::from_slice(&bytes).map_err(|_| Error::HashMissing {
            path: path.to_string(),
            hash_dir: self.hash_dir.to_string(),
        })
    }

    /// Stream `path`'s content through SHA-256 and compare against the
    /// recorded digest.
    pub fn verify(&self, path: &ResolvedPath) -> VerifyOutcome {
        let record = match self.read_record(path) {
            Ok(r) => r,
            Err(_) => return VerifyOutcome::Failed(VerifyFailure::HashMissing),
        };
        let content = match self.host.read_file(path.as_path()) {
            Ok(c) => c,
            Err(_) => return VerifyOutcome::Failed(VerifyFailure::Io),
        };
        let digest = format!("{:x}", Sha256::digest(&content));
        if digest == record.digest {
            VerifyOutcome::Ok
        } else {
            VerifyOutcome::Failed(VerifyFailure::Mismatch)
        }
    }
}
