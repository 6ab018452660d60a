//! Per-command lifecycle (spec §4.5, steps 1-10): resolve the working
//! directory, re-expand templates now that `__runner_workdir` is known,
//! verify and risk-classify the resolved command, assemble its environment,
//! spawn it under the requested identity with no shell involved, and poll it
//! to completion subject to its effective timeout and operator cancellation.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::codec::ResolvedPath;
use crate::config::{CommandConfig, GlobalConfig, GroupConfig};
use crate::error::{Error, Result, Scope};
use crate::exec::capture::CaptureBuffer;
use crate::exec::env_builder::layer_env;
use crate::exec::timeout::{self, EffectiveTimeout};
use crate::host::{ExitStatus, ProcessHost, SpawnRequest};
use crate::privilege::{resolve_identity, PrivilegeCapability, UserLookup};
use crate::risk;
use crate::verify::{require_all_verified, VerificationManager};
use crate::workdir;

const SIGTERM_GRACE: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const UNLIMITED_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Cancellation state an operator SIGINT can put a running command into,
/// polled once per timeout tick (spec §5: "a second SIGINT skips the grace
/// period").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    None,
    Requested,
    Immediate,
}

/// The host-side collaborators a command needs that don't change between
/// commands in a run: process/clock host, privilege capability, user/group
/// lookup, the verification manager (re-verification happens here because
/// templates referencing `__runner_workdir` can resolve `cmd` differently
/// than the load-time placeholder pass did), and the system environment.
pub struct CommandEnv<'a> {
    pub host: &'a dyn ProcessHost,
    pub privilege: &'a PrivilegeCapability,
    pub user_lookup: &'a dyn UserLookup,
    pub manager: &'a VerificationManager,
    pub system_env: &'a HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub command: String,
    pub resolved_cmd: String,
    pub args: Vec<String>,
    pub workdir: ResolvedPath,
    pub exit_status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stdout_dropped: u64,
    pub stderr: Vec<u8>,
    pub stderr_dropped: u64,
    pub timeout: EffectiveTimeout,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration: Duration,
}

impl CommandOutcome {
    pub fn succeeded(&self) -> bool {
        !self.cancelled && !self.timed_out && self.exit_status.map(|s| s.success()).unwrap_or(false)
    }
}

pub fn run_command(
    ctx: &CommandEnv<'_>,
    global: &GlobalConfig,
    group: &GroupConfig,
    command: &CommandConfig,
    group_name: &str,
    group_temp_dir: &ResolvedPath,
    cancel: &dyn Fn() -> CancelState,
    on_heartbeat: &dyn Fn(Duration),
) -> Result<CommandOutcome> {
    let scope = Scope::Command { group: group_name.to_string(), command: command.name.clone() };

    let resolved_workdir = workdir::resolve_workdir(
        command.workdir.as_ref(),
        group.workdir.as_ref(),
        group_temp_dir,
        ctx.host,
    )?;

    // Step 2: re-run the per-command template expansion now that the real
    // `__runner_workdir` is known, without re-running the `vars`/`from_env`
    // resolution pass a second time (load time already produced every value
    // that doesn't depend on the working directory).
    let mut vars = command.expanded_vars.clone();
    vars.insert("__runner_workdir".to_string(), resolved_workdir.to_string());

    let expanded_cmd = command.templates.cmd.expand(&vars, &scope)?;
    let mut expanded_args = Vec::with_capacity(command.templates.args.len());
    for template in &command.templates.args {
        expanded_args.push(template.expand(&vars, &scope)?);
    }
    let mut command_env = command.expanded_env.clone();
    for (name, template) in &command.templates.env_vars {
        command_env.insert(name.clone(), template.expand(&vars, &scope)?);
    }

    let (resolved_path, verification) = ctx.manager.verify_command(&expanded_cmd);
    require_all_verified(std::slice::from_ref(&verification))?;
    let resolved_path = resolved_path.expect("verify_command returns a path whenever verification passed");

    let classified = risk::classify(&expanded_cmd, &expanded_args);
    if classified > command.risk_level {
        return Err(Error::RiskExceeded {
            group: group_name.to_string(),
            command: command.name.clone(),
            classified,
            declared: command.risk_level,
        });
    }

    let env = layer_env(
        ctx.system_env,
        &group.env_allowed,
        &[&global.expanded_env, &group.expanded_env, &command_env],
    );

    let effective_timeout = timeout::resolve(command.timeout, group.timeout, global.timeout);

    let identity = resolve_identity(&command.run_as, ctx.user_lookup)?;
    let program = resolved_path.as_path().to_path_buf();
    let workdir_path = resolved_workdir.as_path().to_path_buf();
    let req = SpawnRequest {
        program: &program,
        args: &expanded_args,
        workdir: &workdir_path,
        env: &env,
    };
    let spawn_result = ctx.privilege.with_privileges(&identity, || ctx.host.spawn(&req))?;
    let pid = spawn_result.map_err(|e| Error::Io { path: expanded_cmd.clone(), source: e })?;

    if let Some(output_file) = &command.output_file {
        ctx.host
            .create_exclusive_file(output_file.as_path())
            .map_err(|e| Error::Io { path: output_file.to_string(), source: e })?;
    }

    let cap = global.output_size_limit as usize;
    let mut stdout_buf = CaptureBuffer::new(cap);
    let mut stderr_buf = CaptureBuffer::new(cap);

    let start = Instant::now();
    let mut last_heartbeat = Duration::ZERO;
    let mut timed_out = false;
    let mut cancelled = false;
    let mut sigtermed_at: Option<Instant> = None;
    let mut sigkilled = false;

    let exit_status = loop {
        let (out, err) = ctx.host.read_output(pid).unwrap_or_default();
        drain_to_output_file(ctx.host, command.output_file.as_ref(), &out);
        stdout_buf.push(&out);
        stderr_buf.push(&err);

        if let Some(status) =
            ctx.host.try_wait(pid).map_err(|e| Error::Io { path: expanded_cmd.clone(), source: e })?
        {
            break Some(status);
        }

        match cancel() {
            CancelState::None => {}
            CancelState::Requested => {
                cancelled = true;
                if sigtermed_at.is_none() {
                    let _ = ctx.host.send_sigterm(pid);
                    sigtermed_at = Some(Instant::now());
                }
            }
            CancelState::Immediate => {
                cancelled = true;
                let _ = ctx.host.send_sigkill(pid);
                sigkilled = true;
            }
        }

        let elapsed = start.elapsed();
        if !cancelled && !effective_timeout.unlimited() && sigtermed_at.is_none() {
            if elapsed >= Duration::from_secs(effective_timeout.seconds) {
                timed_out = true;
                let _ = ctx.host.send_sigterm(pid);
                sigtermed_at = Some(Instant::now());
            }
        }

        if let Some(sigterm_time) = sigtermed_at {
            if !sigkilled && sigterm_time.elapsed() >= SIGTERM_GRACE {
                let _ = ctx.host.send_sigkill(pid);
                sigkilled = true;
            }
        }

        if effective_timeout.unlimited() && elapsed - last_heartbeat >= UNLIMITED_HEARTBEAT_INTERVAL {
            on_heartbeat(elapsed);
            last_heartbeat = elapsed;
        }

        ctx.host.sleep(POLL_INTERVAL);
    };

    let (out, err) = ctx.host.read_output(pid).unwrap_or_default();
    drain_to_output_file(ctx.host, command.output_file.as_ref(), &out);
    stdout_buf.push(&out);
    stderr_buf.push(&err);
    ctx.host.close_output(pid);

    Ok(CommandOutcome {
        command: command.name.clone(),
        resolved_cmd: expanded_cmd,
        args: expanded_args,
        workdir: resolved_workdir,
        exit_status,
        stdout: stdout_buf.bytes().to_vec(),
        stdout_dropped: stdout_buf.dropped(),
        stderr: stderr_buf.bytes().to_vec(),
        stderr_dropped: stderr_buf.dropped(),
        timeout: effective_timeout,
        timed_out,
        cancelled,
        duration: start.elapsed(),
    })
}

fn drain_to_output_file(host: &dyn ProcessHost, output_file: Option<&ResolvedPath>, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    if let Some(path) = output_file {
        let _ = host.append_file(path.as_path(), data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tree::{CommandTemplates, Timeout, DEFAULT_OUTPUT_SIZE_LIMIT};
    use crate::expand::template::Template;
    use crate::host::fake::FakeHost;
    use crate::privilege::{FakeUserLookup, PrivilegeCapability};
    use crate::risk::RiskLevel;
    use crate::verify::VerificationManager;
    use indexmap::IndexMap;
    use std::sync::Arc;

    fn manifest_host(cmd_exec: &str, digest_of: &[u8]) -> Arc<FakeHost> {
        use sha2::Digest;
        let digest = format!("{:x}", sha2::Sha256::digest(digest_of));
        let host = FakeHost::new()
            .with_executable(cmd_exec)
            .with_file(
                &format!("/hashes/{}", crate::codec::encode(&ResolvedPath::new(cmd_exec).unwrap()).as_str()),
                serde_json::to_vec(&serde_json::json!({"algorithm": "sha256", "digest": digest})).unwrap().as_slice(),
            );
        Arc::new(host)
    }

    fn global() -> GlobalConfig {
        GlobalConfig {
            timeout: Timeout::inherit(),
            log_level: None,
            verify_standard_paths: true,
            output_size_limit: DEFAULT_OUTPUT_SIZE_LIMIT,
            expanded_vars: IndexMap::new(),
            expanded_env: IndexMap::new(),
            expanded_verify_files: Vec::new(),
        }
    }

    fn group(workdir: Option<ResolvedPath>) -> GroupConfig {
        GroupConfig {
            name: "g".to_string(),
            description: None,
            priority: 0,
            workdir,
            timeout: Timeout::inherit(),
            env_allowed: HashSet::new(),
            expanded_vars: IndexMap::new(),
            expanded_env: IndexMap::new(),
            expanded_verify_files: Vec::new(),
            commands: Vec::new(),
        }
    }

    fn command(risk_level: RiskLevel) -> CommandConfig {
        let scope = Scope::Command { group: "g".to_string(), command: "c".to_string() };
        CommandConfig {
            name: "c".to_string(),
            expanded_cmd: "/usr/bin/true".to_string(),
            expanded_args: Vec::new(),
            workdir: None,
            timeout: Timeout::inherit(),
            risk_level,
            run_as: Default::default(),
            output_file: None,
            expanded_vars: IndexMap::new(),
            expanded_env: IndexMap::new(),
            templates: CommandTemplates {
                cmd: Template::parse("/usr/bin/true", &scope).unwrap(),
                args: Vec::new(),
                env_vars: Vec::new(),
                workdir: None,
            },
        }
    }

    fn lookup() -> FakeUserLookup {
        FakeUserLookup { users: Default::default(), groups: Default::default() }
    }

    #[test]
    fn runs_to_completion_and_reports_success() {
        let host = manifest_host("/usr/bin/true", b"");
        let store = crate::codec::HashStore::new(ResolvedPath::new("/hashes").unwrap(), host.clone());
        let manager = VerificationManager::new(store, host.clone(), true);
        let privilege = PrivilegeCapability::fake(false);
        let user_lookup = lookup();
        let system_env = HashMap::new();
        let ctx = CommandEnv {
            host: host.as_ref(),
            privilege: &privilege,
            user_lookup: &user_lookup,
            manager: &manager,
            system_env: &system_env,
        };
        let g = group(Some(ResolvedPath::new("/work").unwrap()));
        host.create_dir_all(std::path::Path::new("/work")).unwrap();
        let cmd = command(RiskLevel::Low);
        let temp = ResolvedPath::new("/tmp/scr-g-x").unwrap();
        let outcome = run_command(&ctx, &global(), &g, &cmd, "g", &temp, &|| CancelState::None, &|_| {}).unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.resolved_cmd, "/usr/bin/true");
    }

    #[test]
    fn risk_above_declared_level_is_rejected() {
        let host = manifest_host("/usr/bin/true", b"");
        let store = crate::codec::HashStore::new(ResolvedPath::new("/hashes").unwrap(), host.clone());
        let manager = VerificationManager::new(store, host.clone(), true);
        let privilege = PrivilegeCapability::fake(false);
        let user_lookup = lookup();
        let system_env = HashMap::new();
        let ctx = CommandEnv {
            host: host.as_ref(),
            privilege: &privilege,
            user_lookup: &user_lookup,
            manager: &manager,
            system_env: &system_env,
        };
        let g = group(Some(ResolvedPath::new("/work").unwrap()));
        host.create_dir_all(std::path::Path::new("/work")).unwrap();
        let scope = Scope::Command { group: "g".to_string(), command: "c".to_string() };
        let mut cmd = command(RiskLevel::Low);
        cmd.expanded_cmd = "/usr/bin/sudo".to_string();
        cmd.templates.cmd = Template::parse("/usr/bin/sudo", &scope).unwrap();
        let host2 = manifest_host("/usr/bin/sudo", b"");
        let store2 = crate::codec::HashStore::new(ResolvedPath::new("/hashes").unwrap(), host2.clone());
        let manager2 = VerificationManager::new(store2, host2.clone(), true);
        host2.create_dir_all(std::path::Path::new("/work")).unwrap();
        let ctx2 = CommandEnv {
            host: host2.as_ref(),
            privilege: &privilege,
            user_lookup: &user_lookup,
            manager: &manager2,
            system_env: &system_env,
        };
        let temp = ResolvedPath::new("/tmp/scr-g-x").unwrap();
        let err = run_command(&ctx2, &global(), &g, &cmd, "g", &temp, &|| CancelState::None, &|_| {}).unwrap_err();
        assert!(matches!(err, Error::RiskExceeded { .. }));
    }

    #[test]
    fn cancellation_before_exit_marks_outcome_cancelled() {
        let host = manifest_host("/usr/bin/true", b"");
        let store = crate::codec::HashStore::new(ResolvedPath::new("/hashes").unwrap(), host.clone());
        let manager = VerificationManager::new(store, host.clone(), true);
        host.create_dir_all(std::path::Path::new("/work")).unwrap();
        *host.pending_waits.lock().unwrap() = 2;
        let privilege = PrivilegeCapability::fake(false);
        let user_lookup = lookup();
        let system_env = HashMap::new();
        let ctx = CommandEnv {
            host: host.as_ref(),
            privilege: &privilege,
            user_lookup: &user_lookup,
            manager: &manager,
            system_env: &system_env,
        };
        let g = group(Some(ResolvedPath::new("/work").unwrap()));
        let cmd = command(RiskLevel::Low);
        let temp = ResolvedPath::new("/tmp/scr-g-x").unwrap();
        let outcome =
            run_command(&ctx, &global(), &g, &cmd, "g", &temp, &|| CancelState::Requested, &|_| {}).unwrap();
        assert!(outcome.cancelled);
        assert!(!outcome.succeeded());
    }
}
