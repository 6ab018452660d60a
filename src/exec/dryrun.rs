//! Dry-run mode (spec §4.5 "Dry-run mode"): runs the same pipeline as a real
//! invocation but never spawns a child, never creates a group temp dir on
//! disk, and never materializes `output_file`. Verification failures are
//! recorded rather than aborting the run.

use serde::Serialize;

use crate::config::{CommandConfig, ConfigTree, GroupConfig};
use crate::error::{Error, Result};
use crate::exec::env_builder::layer_env;
use crate::exec::group::dry_run_temp_dir_path;
use crate::exec::timeout::{self, EffectiveTimeout};
use crate::host::ProcessHost;
use crate::risk::{self, RiskLevel};
use crate::verify::{VerificationManager, VerificationResult};
use crate::workdir;

/// How much detail a text/json dry-run report includes (spec §6
/// `--dry-run-detail {summary,detailed,full}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DryRunDetail {
    Summary,
    Detailed,
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DryRunFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRunCommand {
    pub name: String,
    pub resolved_cmd: String,
    pub args: Vec<String>,
    pub workdir: String,
    pub timeout_seconds: u64,
    pub timeout_source: &'static str,
    pub risk_declared: RiskLevel,
    pub risk_classified: RiskLevel,
    pub risk_exceeded: bool,
    /// Only populated at `Full` detail: the fully layered child environment,
    /// key=value, in the order each key was last set.
    pub env: Vec<(String, String)>,
    pub verification: Vec<String>,
    pub verification_failed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRunGroup {
    pub name: String,
    pub temp_dir: String,
    pub commands: Vec<DryRunCommand>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub groups: Vec<DryRunGroup>,
    pub any_verification_failed: bool,
}

impl DryRunReport {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Io {
            path: "<dry-run report>".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })
    }

    pub fn to_text(&self, detail: DryRunDetail) -> String {
        let mut out = String::new();
        for group in &self.groups {
            out.push_str(&format!("group {} (workdir {})\n", group.name, group.temp_dir));
            for cmd in &group.commands {
                out.push_str(&format!(
                    "  {} -> {} {}\n",
                    cmd.name,
                    cmd.resolved_cmd,
                    cmd.args.join(" ")
                ));
                if matches!(detail, DryRunDetail::Detailed | DryRunDetail::Full) {
                    out.push_str(&format!(
                        "    timeout={}s (from {}) risk={}->{}{}\n",
                        cmd.timeout_seconds,
                        cmd.timeout_source,
                        cmd.risk_declared,
                        cmd.risk_classified,
                        if cmd.risk_exceeded { " EXCEEDED" } else { "" }
                    ));
                    for v in &cmd.verification {
                        out.push_str(&format!("    verify: {v}\n"));
                    }
                }
                if matches!(detail, DryRunDetail::Full) {
                    for (k, v) in &cmd.env {
                        out.push_str(&format!("    env: {k}={v}\n"));
                    }
                }
            }
        }
        out
    }
}

/// System environment / allowlist threaded through without a full
/// `CommandEnv`, since dry-run never spawns and so needs neither a
/// `ProcessHost` identity nor a `PrivilegeCapability`.
pub fn run_dry_run(
    tree: &ConfigTree,
    manager: &VerificationManager,
    host: &dyn ProcessHost,
    system_env: &std::collections::HashMap<String, String>,
) -> Result<DryRunReport> {
    let mut groups = Vec::new();
    let mut any_verification_failed = false;

    for (i, group) in tree.groups_in_order().into_iter().enumerate() {
        let temp_dir = dry_run_temp_dir_path(&group.name, &i.to_string())?;
        let mut commands = Vec::new();

        for command in &group.commands {
            let (dc, failed) = dry_run_command(tree, group, command, manager, host, system_env, &temp_dir)?;
            any_verification_failed |= failed;
            commands.push(dc);
        }

        groups.push(DryRunGroup {
            name: group.name.clone(),
            temp_dir: temp_dir.to_string(),
            commands,
        });
    }

    Ok(DryRunReport { groups, any_verification_failed })
}

fn dry_run_command(
    tree: &ConfigTree,
    group: &GroupConfig,
    command: &CommandConfig,
    manager: &VerificationManager,
    host: &dyn ProcessHost,
    system_env: &std::collections::HashMap<String, String>,
    group_temp_dir: &crate::codec::ResolvedPath,
) -> Result<(DryRunCommand, bool)> {
    let workdir = match workdir::resolve_workdir(command.workdir.as_ref(), group.workdir.as_ref(), group_temp_dir, host) {
        Ok(w) => w.to_string(),
        Err(e) => format!("<unresolved: {e}>"),
    };

    let (_, verification) = manager.verify_command(&command.expanded_cmd);
    let verification_failed = verification.is_failed();
    let verification_lines = vec![verification.to_string()];

    let classified = risk::classify(&command.expanded_cmd, &command.expanded_args);
    let risk_exceeded = classified > command.risk_level;

    let effective_timeout: EffectiveTimeout = timeout::resolve(command.timeout, group.timeout, tree.global.timeout);

    let env = layer_env(
        system_env,
        &group.env_allowed,
        &[&tree.global.expanded_env, &group.expanded_env, &command.expanded_env],
    );
    let mut env_sorted: Vec<(String, String)> = env.into_iter().collect();
    env_sorted.sort_by(|a, b| a.0.cmp(&b.0));

    Ok((
        DryRunCommand {
            name: command.name.clone(),
            resolved_cmd: command.expanded_cmd.clone(),
            args: command.expanded_args.clone(),
            workdir,
            timeout_seconds: effective_timeout.seconds,
            timeout_source: effective_timeout.source,
            risk_declared: command.risk_level,
            risk_classified: classified,
            risk_exceeded,
            env: env_sorted,
            verification: verification_lines,
            verification_failed,
        },
        verification_failed,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{HashStore, ResolvedPath};
    use crate::config::tree::{CommandTemplates, GlobalConfig, Timeout, DEFAULT_OUTPUT_SIZE_LIMIT};
    use crate::error::Scope;
    use crate::expand::template::Template;
    use crate::host::fake::FakeHost;
    use crate::privilege::RunAs;
    use indexmap::IndexMap;
    use sha2::Digest;
    use std::sync::Arc;

    fn tree_with_one_command() -> ConfigTree {
        let scope = Scope::Command { group: "g".to_string(), command: "c".to_string() };
        let command = CommandConfig {
            name: "c".to_string(),
            expanded_cmd: "/usr/bin/true".to_string(),
            expanded_args: vec!["--flag".to_string()],
            workdir: None,
            timeout: Timeout::inherit(),
            risk_level: RiskLevel::Low,
            run_as: RunAs::default(),
            output_file: None,
            expanded_vars: IndexMap::new(),
            expanded_env: IndexMap::new(),
            templates: CommandTemplates {
                cmd: Template::parse("/usr/bin/true", &scope).unwrap(),
                args: vec![Template::parse("--flag", &scope).unwrap()],
                env_vars: Vec::new(),
                workdir: None,
            },
        };
        let group = GroupConfig {
            name: "g".to_string(),
            description: None,
            priority: 0,
            workdir: Some(ResolvedPath::new("/work").unwrap()),
            timeout: Timeout::inherit(),
            env_allowed: std::collections::HashSet::new(),
            expanded_vars: IndexMap::new(),
            expanded_env: IndexMap::new(),
            expanded_verify_files: Vec::new(),
            commands: vec![command],
        };
        ConfigTree {
            global: GlobalConfig {
                timeout: Timeout::inherit(),
                log_level: None,
                verify_standard_paths: true,
                output_size_limit: DEFAULT_OUTPUT_SIZE_LIMIT,
                expanded_vars: IndexMap::new(),
                expanded_env: IndexMap::new(),
                expanded_verify_files: Vec::new(),
            },
            groups: vec![group],
        }
    }

    #[test]
    fn dry_run_never_touches_a_real_temp_dir() {
        let host = Arc::new(
            FakeHost::new()
                .with_executable("/usr/bin/true")
                .with_file(
                    "/hashes/~usr~bin~true",
                    serde_json::to_vec(&crate::codec::HashRecord {
                        algorithm: "sha256".into(),
                        digest: format!("{:x}", sha2::Sha256::digest(&[] as &[u8])),
                    })
                    .unwrap()
                    .as_slice(),
                ),
        );
        host.create_dir_all(std::path::Path::new("/work")).unwrap();
        let store = HashStore::new(ResolvedPath::new("/hashes").unwrap(), host.clone());
        let manager = VerificationManager::new(store, host.clone(), true);
        let tree = tree_with_one_command();
        let system_env = std::collections::HashMap::new();

        let report = run_dry_run(&tree, &manager, host.as_ref(), &system_env).unwrap();
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.groups[0].temp_dir, "/dry-run/scr-g-0");
        assert!(!host.is_directory(std::path::Path::new("/dry-run/scr-g-0")));
        assert!(!report.any_verification_failed);
        assert_eq!(report.groups[0].commands[0].resolved_cmd, "/usr/bin/true");
    }

    #[test]
    fn dry_run_records_verification_failure_instead_of_aborting() {
        let host = Arc::new(FakeHost::new().with_executable("/usr/bin/true"));
        host.create_dir_all(std::path::Path::new("/work")).unwrap();
        let store = HashStore::new(ResolvedPath::new("/hashes").unwrap(), host.clone());
        let manager = VerificationManager::new(store, host.clone(), true);
        let tree = tree_with_one_command();
        let system_env = std::collections::HashMap::new();

        let report = run_dry_run(&tree, &manager, host.as_ref(), &system_env).unwrap();
        assert!(report.any_verification_failed);
        assert!(report.groups[0].commands[0].verification_failed);
    }

    #[test]
    fn text_rendering_at_summary_detail_omits_verification_lines() {
        let host = Arc::new(FakeHost::new().with_executable("/usr/bin/true"));
        host.create_dir_all(std::path::Path::new("/work")).unwrap();
        let store = HashStore::new(ResolvedPath::new("/hashes").unwrap(), host.clone());
        let manager = VerificationManager::new(store, host.clone(), true);
        let tree = tree_with_one_command();
        let system_env = std::collections::HashMap::new();
        let report = run_dry_run(&tree, &manager, host.as_ref(), &system_env).unwrap();

        let summary = report.to_text(DryRunDetail::Summary);
        assert!(summary.contains("/usr/bin/true"));
        assert!(!summary.contains("verify:"));

        let full = report.to_text(DryRunDetail::Full);
        assert!(full.contains("verify:"));
    }
}
