//! Closed error taxonomy for the runner core.
//!
//! Every failure mode named in the design is one variant here. Callers match
//! on `Error` rather than on strings; each variant carries the structured
//! context (scope, field, offending name, ...) needed to locate the
//! offending manifest entry and, where one exists, a remediation hint.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Where in the configuration tree an error occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Global,
    Group(String),
    Command { group: String, command: String },
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Group(g) => write!(f, "group '{g}'"),
            Scope::Command { group, command } => {
                write!(f, "command '{command}' in group '{group}'")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyFailure {
    HashMissing,
    Mismatch,
    Io,
    BadPath,
    PolicyDenied,
}

impl fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerifyFailure::HashMissing => "hash record missing",
            VerifyFailure::Mismatch => "hash mismatch",
            VerifyFailure::Io => "i/o error",
            VerifyFailure::BadPath => "bad path",
            VerifyFailure::PolicyDenied => "policy denied",
        };
        write!(f, "{s}")
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    // --- Configuration errors -------------------------------------------
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("invalid variable name '{name}' in {scope}: names must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidVariableName { name: String, scope: Scope },

    #[error("reserved variable name '{name}' in {scope}: names beginning with '__' may only be produced by the engine")]
    ReservedVariableName { name: String, scope: Scope },

    #[error("scope mismatch for '{name}' in {scope}: {reason}")]
    ScopeMismatch {
        name: String,
        scope: Scope,
        reason: String,
    },

    #[error("duplicate {kind} name '{name}'")]
    DuplicateName { kind: &'static str, name: String },

    #[error("deprecated syntax '${{{name}}}' in {scope}: use '%{{{name}}}' (consider `env_import = [\"{lower}={name}\"]`)")]
    DeprecatedSyntax {
        name: String,
        lower: String,
        scope: Scope,
    },

    #[error("invalid escape sequence '\\{ch}' in {scope}")]
    InvalidEscape { ch: char, scope: Scope },

    #[error("unknown field '{field}' in manifest: {remediation}")]
    UnknownField {
        field: String,
        remediation: String,
    },

    // --- Expansion errors -------------------------------------------------
    #[error("undefined variable '{name}' referenced in {scope}")]
    UndefinedVariable { name: String, scope: Scope },

    #[error("circular reference in {scope}: {}", chain.join(" -> "))]
    CircularReference { scope: Scope, chain: Vec<String> },

    #[error("variable '{name}' not in allowlist for {scope}: add '{name}' to `env_allowed`")]
    VariableNotInAllowlist { name: String, scope: Scope },

    #[error("template in {scope} field '{field}' references local variable '{name}': put it in this command's own `vars` or promote it to a global variable")]
    TemplateLocalReference {
        name: String,
        field: String,
        scope: Scope,
    },

    // --- Verification errors ----------------------------------------------
    #[error("hash record missing for '{path}' in {hash_dir}")]
    HashMissing { path: String, hash_dir: String },

    #[error("hash mismatch for '{path}': expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("fallback-encoded hash filename '{name}' is not reversible")]
    FallbackNotReversible { name: String },

    #[error("i/o error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bad command reference '{cmd}': relative paths with '/' are not allowed, use a bare name or an absolute path")]
    BadCommandReference { cmd: String },

    #[error("command '{cmd}' not found on the policy path")]
    NotFound { cmd: String },

    #[error("'{path}' is denied by policy: {reason}")]
    PolicyDenied { path: String, reason: String },

    // --- Execution errors --------------------------------------------------
    #[error("command '{command}' in group '{group}' exceeds declared risk level: classified {classified:?} > declared {declared:?}")]
    RiskExceeded {
        group: String,
        command: String,
        classified: crate::risk::RiskLevel,
        declared: crate::risk::RiskLevel,
    },

    #[error("privilege transition unavailable: {reason}")]
    PrivilegeUnavailable { reason: String },

    #[error("command '{command}' in group '{group}' timed out after {secs}s")]
    Timeout {
        group: String,
        command: String,
        secs: u64,
    },

    #[error("output for command '{command}' in group '{group}' exceeded the {limit}-byte cap")]
    OutputOverflow {
        group: String,
        command: String,
        limit: u64,
    },

    #[error("command '{command}' in group '{group}' exited with code {exit_code}")]
    ChildFailed {
        group: String,
        command: String,
        exit_code: i32,
    },

    #[error("command '{command}' in group '{group}' was cancelled")]
    Cancelled { group: String, command: String },
}

impl Error {
    /// Whether this error is fatal before any command has run (aborts the
    /// whole invocation with exit code 1), as opposed to an execution-time
    /// error (§7 propagation policy) that only cancels the rest of a group.
    pub fn is_fatal_before_execution(&self) -> bool {
        !matches!(
            self,
            Error::RiskExceeded { .. }
                | Error::PrivilegeUnavailable { .. }
                | Error::Timeout { .. }
                | Error::OutputOverflow { .. }
                | Error::ChildFailed { .. }
                | Error::Cancelled { .. }
        )
    }
}
