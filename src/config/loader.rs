//! Ties raw.rs, the expansion engine, and the verification manager together
//! into one frozen `ConfigTree`, enforcing every load-time invariant in
//! spec §3.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::codec::{HashStore, ResolvedPath};
use crate::config::raw::{self, RawCommand, RawGroup, RawManifest};
use crate::config::tree::{CommandConfig, ConfigTree, GlobalConfig, GroupConfig, Timeout, DEFAULT_OUTPUT_SIZE_LIMIT};
use crate::error::{Error, Result, Scope};
use crate::expand::{
    automatic_vars, effective_env_allowed, expand_scope, validate_template_local_references, ScopeInputs,
};
use crate::expand::template::Template;
use crate::host::{Clock, ProcessHost};
use crate::risk::RiskLevel;
use crate::privilege::RunAs;
use crate::verify::{require_all_verified, VerificationManager, VerificationResult};

/// A placeholder absolute path bound to `__runner_workdir` while validating
/// a command's templates at load time, before the group's real working
/// directory exists (it is created lazily at execution, per spec §4.4/§4.5).
const LOAD_TIME_WORKDIR_PLACEHOLDER: &str = "/__scr_load_time_workdir__";

pub struct LoadedConfig {
    pub tree: ConfigTree,
    pub verification: Vec<VerificationResult>,
}

/// Parse, expand, and verify a manifest. `dry_run` controls whether a
/// verification failure aborts the load (normal mode) or is merely
/// collected for the caller to report (dry-run mode); structural/syntactic
/// errors are fatal either way.
pub fn load_config(
    manifest_text: &str,
    manifest_path: &ResolvedPath,
    host: Arc<dyn ProcessHost>,
    clock: &dyn Clock,
    hash_dir: ResolvedPath,
    dry_run: bool,
) -> Result<LoadedConfig> {
    let raw = raw::parse(manifest_text)?;
    let system_env = host.read_system_env();

    let store = HashStore::new(hash_dir, host.clone());
    let manager = VerificationManager::new(store, host.clone(), raw.global.verify_standard_paths);
    let mut verification = Vec::new();

    verification.push(manager.verify_file(manifest_path));
    verification.extend(manager.verify_standard_paths());

    let datetime = clock.now().format("%Y%m%d_%H%M%S").to_string();
    let pid = host.pid();
    let automatic = automatic_vars(&datetime, pid, None);

    let global_allowed = effective_env_allowed(&HashSet::new(), &raw.global.env_allowed);
    let global_input = ScopeInputs {
        scope: Scope::Global,
        env_import: &raw.global.env_import,
        vars: &raw.global.vars,
        env_vars: &raw.global.env_vars,
        verify_files: &raw.global.verify_files,
    };
    let global_expanded = expand_scope(&global_input, &IndexMap::new(), &automatic, &global_allowed, &system_env)?;
    verification.extend(manager.verify_many(&global_expanded.verify_files));

    let global = GlobalConfig {
        timeout: Timeout::parse(raw.global.timeout, &Scope::Global)?,
        log_level: raw.global.log_level.clone(),
        verify_standard_paths: raw.global.verify_standard_paths,
        output_size_limit: raw.global.output_size_limit.unwrap_or(DEFAULT_OUTPUT_SIZE_LIMIT),
        expanded_vars: global_expanded.vars.clone(),
        expanded_env: global_expanded.env,
        expanded_verify_files: global_expanded.verify_files,
    };

    let mut group_names: HashSet<String> = HashSet::new();
    let mut groups = Vec::with_capacity(raw.groups.len());
    for raw_group in &raw.groups {
        if !group_names.insert(raw_group.name.clone()) {
            return Err(Error::DuplicateName { kind: "group", name: raw_group.name.clone() });
        }
        let (group, group_verification) =
            load_group(raw_group, &global, &global_allowed, &automatic, &system_env, &manager)?;
        verification.extend(group_verification);
        groups.push(group);
    }

    let tree = ConfigTree { global, groups };

    if !dry_run {
        require_all_verified(&verification)?;
    }

    Ok(LoadedConfig { tree, verification })
}

fn load_group(
    raw_group: &RawGroup,
    global: &GlobalConfig,
    global_allowed: &HashSet<String>,
    automatic: &IndexMap<String, String>,
    system_env: &std::collections::HashMap<String, String>,
    manager: &VerificationManager,
) -> Result<(GroupConfig, Vec<VerificationResult>)> {
    let scope = Scope::Group(raw_group.name.clone());
    let group_allowed = effective_env_allowed(global_allowed, &raw_group.env_allowed);

    let input = ScopeInputs {
        scope: scope.clone(),
        env_import: &raw_group.env_import,
        vars: &raw_group.vars,
        env_vars: &raw_group.env_vars,
        verify_files: &raw_group.verify_files,
    };
    let expanded = expand_scope(&input, &global.expanded_vars, automatic, &group_allowed, system_env)?;

    let mut verification = manager.verify_many(&expanded.verify_files);

    let workdir = match &raw_group.workdir {
        None => None,
        Some(raw) => {
            let template = Template::parse(raw, &scope)?;
            let resolved = template.expand(&expanded.vars, &scope)?;
            Some(ResolvedPath::new(resolved)?)
        }
    };

    let mut command_names: HashSet<String> = HashSet::new();
    let mut commands = Vec::with_capacity(raw_group.commands.len());
    for raw_command in &raw_group.commands {
        if !command_names.insert(raw_command.name.clone()) {
            return Err(Error::DuplicateName { kind: "command", name: raw_command.name.clone() });
        }
        let (command, command_verification) = load_command(
            raw_command,
            &raw_group.name,
            &expanded.vars,
            &group_allowed,
            automatic,
            system_env,
            manager,
        )?;
        verification.extend(command_verification);
        commands.push(command);
    }

    Ok((
        GroupConfig {
            name: raw_group.name.clone(),
            description: raw_group.description.clone(),
            priority: raw_group.priority,
            workdir,
            timeout: Timeout::parse(raw_group.timeout, &scope)?,
            env_allowed: group_allowed,
            expanded_vars: expanded.vars,
            expanded_env: expanded.env,
            expanded_verify_files: expanded.verify_files,
            commands,
        },
        verification,
    ))
}

fn load_command(
    raw_command: &RawCommand,
    group_name: &str,
    group_vars: &IndexMap<String, String>,
    group_allowed: &HashSet<String>,
    automatic_no_workdir: &IndexMap<String, String>,
    system_env: &std::collections::HashMap<String, String>,
    manager: &VerificationManager,
) -> Result<(CommandConfig, Vec<VerificationResult>)> {
    let scope = Scope::Command {
        group: group_name.to_string(),
        command: raw_command.name.clone(),
    };

    // Re-bind __runner_workdir to a placeholder for load-time validation;
    // the real value is only known once the group's working directory is
    // materialized at execution time (spec §4.5 step 2 re-runs this pass).
    let mut automatic = automatic_no_workdir.clone();
    automatic.insert("__runner_workdir".to_string(), LOAD_TIME_WORKDIR_PLACEHOLDER.to_string());

    // Commands have no own env_allowed; the effective allowlist is
    // inherited unchanged from the group.
    let command_allowed = effective_env_allowed(group_allowed, &[]);

    let input = ScopeInputs {
        scope: scope.clone(),
        env_import: &raw_command.env_import,
        vars: &raw_command.vars,
        env_vars: &raw_command.env_vars,
        verify_files: &[],
    };
    let expanded = expand_scope(&input, group_vars, &automatic, &command_allowed, system_env)?;

    let own_vars: HashSet<String> = raw_command
        .vars
        .iter()
        .filter_map(|entry| crate::expand::engine::split_kv(entry).map(|(k, _)| k.to_string()))
        .collect();

    let cmd_template = Template::parse(&raw_command.cmd, &scope)?;
    validate_template_local_references(&scope, "cmd", &cmd_template, &own_vars)?;
    let expanded_cmd = cmd_template.expand(&expanded.vars, &scope)?;

    let mut arg_templates = Vec::with_capacity(raw_command.args.len());
    let mut expanded_args = Vec::with_capacity(raw_command.args.len());
    for (i, raw_arg) in raw_command.args.iter().enumerate() {
        let template = Template::parse(raw_arg, &scope)?;
        validate_template_local_references(&scope, &format!("args[{i}]"), &template, &own_vars)?;
        expanded_args.push(template.expand(&expanded.vars, &scope)?);
        arg_templates.push(template);
    }

    let mut env_var_templates = Vec::with_capacity(raw_command.env_vars.len());
    for entry in &raw_command.env_vars {
        if let Some((name, value_tpl)) = crate::expand::engine::split_kv(entry) {
            let template = Template::parse(value_tpl, &scope)?;
            validate_template_local_references(&scope, "env_vars", &template, &own_vars)?;
            env_var_templates.push((name.to_string(), template));
        }
    }

    let mut workdir_template = None;
    let workdir = match &raw_command.workdir {
        None => None,
        Some(raw) => {
            let template = Template::parse(raw, &scope)?;
            validate_template_local_references(&scope, "workdir", &template, &own_vars)?;
            let resolved = template.expand(&expanded.vars, &scope)?;
            workdir_template = Some(template);
            Some(ResolvedPath::new(resolved)?)
        }
    };

    let output_file = match &raw_command.output_file {
        None => None,
        Some(raw) => {
            let template = Template::parse(raw, &scope)?;
            let resolved = template.expand(&expanded.vars, &scope)?;
            Some(ResolvedPath::new(resolved)?)
        }
    };

    let risk_level = match &raw_command.risk_level {
        Some(s) => RiskLevel::from_str(s).ok_or_else(|| Error::InvalidPath {
            path: format!("risk_level in {scope}"),
            reason: format!("unknown risk level '{s}'"),
        })?,
        None => RiskLevel::Low,
    };

    let (_, cmd_verification) = manager.verify_command(&expanded_cmd);
    let verification = vec![cmd_verification];

    Ok((
        CommandConfig {
            name: raw_command.name.clone(),
            expanded_cmd,
            expanded_args,
            workdir,
            timeout: Timeout::parse(raw_command.timeout, &scope)?,
            risk_level,
            run_as: RunAs { user: raw_command.run_as_user.clone(), group: raw_command.run_as_group.clone() },
            output_file,
            expanded_vars: expanded.vars,
            expanded_env: expanded.env,
            templates: crate::config::tree::CommandTemplates {
                cmd: cmd_template,
                args: arg_templates,
                env_vars: env_var_templates,
                workdir: workdir_template,
            },
        },
        verification,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::FakeHost;
    use crate::host::FixedClock;
    use chrono::{DateTime, Local};

    fn clock() -> FixedClock {
        let t = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Local);
        FixedClock(t)
    }

    fn host_with_manifest_and_hashes() -> Arc<dyn ProcessHost> {
        use sha2::Digest;
        let manifest_digest = format!("{:x}", sha2::Sha256::digest(b"manifest"));
        let make_digest = format!("{:x}", sha2::Sha256::digest(b""));
        let host = FakeHost::new()
            .with_executable("/usr/bin/make")
            .with_file("/cfg/manifest.toml", b"manifest")
            .with_file(
                "/hashes/~cfg~manifest.toml",
                serde_json::to_vec(&serde_json::json!({"algorithm": "sha256", "digest": manifest_digest})).unwrap().as_slice(),
            )
            .with_file(
                "/hashes/~usr~bin~make",
                serde_json::to_vec(&serde_json::json!({"algorithm": "sha256", "digest": make_digest})).unwrap().as_slice(),
            )
            .with_env("HOME", "/h");
        Arc::new(host)
    }

    #[test]
    fn loads_minimal_manifest_end_to_end() {
        let host = host_with_manifest_and_hashes();
        let text = r#"
            [global]
            env_allowed = ["HOME"]
            env_import = ["home=HOME"]
            vars = ["app_dir=%{home}/app"]

            [[groups]]
            name = "build"

            [[groups.commands]]
            name = "compile"
            cmd = "make"
        "#;
        let manifest_path = ResolvedPath::new("/cfg/manifest.toml").unwrap();
        let hash_dir = ResolvedPath::new("/hashes").unwrap();
        let clock = clock();
        let loaded = load_config(text, &manifest_path, host, &clock, hash_dir, false).unwrap();
        assert_eq!(loaded.tree.global.expanded_vars.get("app_dir").unwrap(), "/h/app");
        assert_eq!(loaded.tree.groups[0].commands[0].expanded_cmd, "make");
        assert!(loaded.verification.iter().all(|r| !r.is_failed()));
    }

    #[test]
    fn duplicate_group_names_rejected() {
        let host = host_with_manifest_and_hashes();
        let text = r#"
            [[groups]]
            name = "dup"

            [[groups]]
            name = "dup"
        "#;
        let manifest_path = ResolvedPath::new("/cfg/manifest.toml").unwrap();
        let hash_dir = ResolvedPath::new("/hashes").unwrap();
        let clock = clock();
        let err = load_config(text, &manifest_path, host, &clock, hash_dir, false).unwrap_err();
        assert!(matches!(err, Error::DuplicateName { kind: "group", .. }));
    }

    #[test]
    fn s4_template_local_reference_rejected() {
        let host = host_with_manifest_and_hashes();
        let text = r#"
            [[groups]]
            name = "g"
            vars = ["logd=/l"]

            [[groups.commands]]
            name = "c"
            cmd = "make"
            args = ["%{logd}"]
        "#;
        let manifest_path = ResolvedPath::new("/cfg/manifest.toml").unwrap();
        let hash_dir = ResolvedPath::new("/hashes").unwrap();
        let clock = clock();
        let err = load_config(text, &manifest_path, host, &clock, hash_dir, false).unwrap_err();
        assert!(matches!(err, Error::TemplateLocalReference { .. }));
    }

    #[test]
    fn s2_global_scope_violation_rejected() {
        let host = host_with_manifest_and_hashes();
        let text = r#"
            [global]
            vars = ["mydir=/x"]
        "#;
        let manifest_path = ResolvedPath::new("/cfg/manifest.toml").unwrap();
        let hash_dir = ResolvedPath::new("/hashes").unwrap();
        let clock = clock();
        let err = load_config(text, &manifest_path, host, &clock, hash_dir, false).unwrap_err();
        assert!(matches!(err, Error::ScopeMismatch { .. }));
    }

    #[test]
    fn missing_hash_record_aborts_normal_load() {
        let host: Arc<dyn ProcessHost> = Arc::new(
            FakeHost::new()
                .with_executable("/usr/bin/make")
                .with_file("/cfg/manifest.toml", b"manifest"),
        );
        let text = r#"
            [[groups]]
            name = "g"

            [[groups.commands]]
            name = "c"
            cmd = "make"
        "#;
        let manifest_path = ResolvedPath::new("/cfg/manifest.toml").unwrap();
        let hash_dir = ResolvedPath::new("/hashes").unwrap();
        let clock = clock();
        assert!(load_config(text, &manifest_path, host, &clock, hash_dir, false).is_err());
    }

    #[test]
    fn dry_run_collects_verification_failures_without_aborting() {
        let host: Arc<dyn ProcessHost> = Arc::new(
            FakeHost::new()
                .with_executable("/usr/bin/make")
                .with_file("/cfg/manifest.toml", b"manifest"),
        );
        let text = r#"
            [[groups]]
            name = "g"

            [[groups.commands]]
            name = "c"
            cmd = "make"
        "#;
        let manifest_path = ResolvedPath::new("/cfg/manifest.toml").unwrap();
        let hash_dir = ResolvedPath::new("/hashes").unwrap();
        let clock = clock();
        let loaded = load_config(text, &manifest_path, host, &clock, hash_dir, true).unwrap();
        assert!(loaded.verification.iter().any(|r| r.is_failed()));
    }
}
