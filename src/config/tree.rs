//! The frozen configuration tree (spec §3): global, per-group, per-command,
//! each carrying its write-once `expanded_*` fields alongside the raw
//! manifest fields that survive past load time.

use indexmap::IndexMap;

use crate::codec::ResolvedPath;
use crate::error::{Error, Result, Scope};
use crate::expand::template::Template;
use crate::privilege::RunAs;
use crate::risk::RiskLevel;

pub const DEFAULT_OUTPUT_SIZE_LIMIT: u64 = 10 * 1024 * 1024;

/// `timeout` is nullable: absent means "inherit from the parent level",
/// `Some(0)` means unlimited, `Some(n > 0)` is a bound in seconds. Negative
/// values are rejected at parse time rather than carried as a sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout(Option<u64>);

impl Timeout {
    pub fn parse(raw: Option<i64>, scope: &Scope) -> Result<Self> {
        match raw {
            None => Ok(Timeout(None)),
            Some(n) if n < 0 => Err(Error::InvalidPath {
                path: format!("timeout in {scope}"),
                reason: format!("negative timeout {n} is not allowed"),
            }),
            Some(n) => Ok(Timeout(Some(n as u64))),
        }
    }

    pub fn inherit() -> Self {
        Timeout(None)
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    /// `None` if this level doesn't set a timeout (caller should fall
    /// through to the next level); `Some(0)` means unlimited.
    pub fn seconds(&self) -> Option<u64> {
        self.0
    }
}

/// Walk (command, group, global, system-default) in order and return the
/// first set value along with which level it came from, per spec §4.5.6.
pub fn resolve_effective_timeout(
    command: Timeout,
    group: Timeout,
    global: Timeout,
    system_default: u64,
) -> (u64, &'static str) {
    if let Some(secs) = command.seconds() {
        return (secs, "command");
    }
    if let Some(secs) = group.seconds() {
        return (secs, "group");
    }
    if let Some(secs) = global.seconds() {
        return (secs, "global");
    }
    (system_default, "system default")
}

#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub timeout: Timeout,
    pub log_level: Option<String>,
    pub verify_standard_paths: bool,
    pub output_size_limit: u64,
    pub expanded_vars: IndexMap<String, String>,
    pub expanded_env: IndexMap<String, String>,
    pub expanded_verify_files: Vec<ResolvedPath>,
}

#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub name: String,
    pub description: Option<String>,
    pub priority: i64,
    pub workdir: Option<ResolvedPath>,
    pub timeout: Timeout,
    /// The effective `env_allowed` set (global ∪ this group's own), used to
    /// filter system environment at execution time. Commands have no env
    /// allowlist of their own, so they reuse their owning group's.
    pub env_allowed: std::collections::HashSet<String>,
    pub expanded_vars: IndexMap<String, String>,
    pub expanded_env: IndexMap<String, String>,
    pub expanded_verify_files: Vec<ResolvedPath>,
    pub commands: Vec<CommandConfig>,
}

/// The parsed-but-unexpanded templates behind a command's surface fields,
/// kept alongside the load-time expansion so execution can re-expand
/// `cmd`/`args`/`env_vars`/`workdir` once the real `__runner_workdir` is
/// known (spec §4.5 step 2), without re-running the full `vars`/`from_env`
/// resolution pass a second time.
#[derive(Debug, Clone)]
pub struct CommandTemplates {
    pub cmd: Template,
    pub args: Vec<Template>,
    pub env_vars: Vec<(String, Template)>,
    pub workdir: Option<Template>,
}

#[derive(Debug, Clone)]
pub struct CommandConfig {
    pub name: String,
    pub expanded_cmd: String,
    pub expanded_args: Vec<String>,
    pub workdir: Option<ResolvedPath>,
    pub timeout: Timeout,
    pub risk_level: RiskLevel,
    pub run_as: RunAs,
    pub output_file: Option<ResolvedPath>,
    pub expanded_vars: IndexMap<String, String>,
    pub expanded_env: IndexMap<String, String>,
    pub templates: CommandTemplates,
}

#[derive(Debug, Clone)]
pub struct ConfigTree {
    pub global: GlobalConfig,
    pub groups: Vec<GroupConfig>,
}

impl ConfigTree {
    /// Groups in configured execution order (spec §3: `priority` orders
    /// groups within a run).
    pub fn groups_in_order(&self) -> Vec<&GroupConfig> {
        let mut groups: Vec<&GroupConfig> = self.groups.iter().collect();
        groups.sort_by_key(|g| g.priority);
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_rejects_negative() {
        let err = Timeout::parse(Some(-1), &Scope::Global).unwrap_err();
        assert!(matches!(err, Error::InvalidPath { .. }));
    }

    #[test]
    fn timeout_zero_is_unlimited_and_set() {
        let t = Timeout::parse(Some(0), &Scope::Global).unwrap();
        assert_eq!(t.seconds(), Some(0));
        assert!(t.is_set());
    }

    #[test]
    fn timeout_absent_falls_through() {
        let t = Timeout::parse(None, &Scope::Global).unwrap();
        assert_eq!(t.seconds(), None);
        assert!(!t.is_set());
    }

    #[test]
    fn effective_timeout_prefers_most_specific_level() {
        let (secs, source) = resolve_effective_timeout(
            Timeout::inherit(),
            Timeout(Some(30)),
            Timeout(Some(60)),
            120,
        );
        assert_eq!(secs, 30);
        assert_eq!(source, "group");
    }

    #[test]
    fn effective_timeout_falls_back_to_system_default() {
        let (secs, source) =
            resolve_effective_timeout(Timeout::inherit(), Timeout::inherit(), Timeout::inherit(), 120);
        assert_eq!(secs, 120);
        assert_eq!(source, "system default");
    }

    #[test]
    fn groups_in_order_sorts_by_priority() {
        let mk = |name: &str, priority: i64| GroupConfig {
            name: name.to_string(),
            description: None,
            priority,
            workdir: None,
            timeout: Timeout::inherit(),
            env_allowed: std::collections::HashSet::new(),
            expanded_vars: IndexMap::new(),
            expanded_env: IndexMap::new(),
            expanded_verify_files: Vec::new(),
            commands: Vec::new(),
        };
        let tree = ConfigTree {
            global: GlobalConfig {
                timeout: Timeout::inherit(),
                log_level: None,
                verify_standard_paths: true,
                output_size_limit: DEFAULT_OUTPUT_SIZE_LIMIT,
                expanded_vars: IndexMap::new(),
                expanded_env: IndexMap::new(),
                expanded_verify_files: Vec::new(),
            },
            groups: vec![mk("second", 2), mk("first", 1)],
        };
        let ordered: Vec<&str> = tree.groups_in_order().iter().map(|g| g.name.as_str()).collect();
        assert_eq!(ordered, vec!["first", "second"]);
    }
}
