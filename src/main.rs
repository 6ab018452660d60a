//! CLI entry point: parse flags, load and verify the manifest, then either
//! render a dry-run plan or execute every group's commands in priority
//! order (spec §6/§7).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use clap::Parser;

use scr::audit::{AuditLogger, RunSummary};
use scr::cli::Cli;
use scr::codec::{HashStore, ResolvedPath};
use scr::config::load_config;
use scr::exec::{run_command, run_dry_run, CancelState, CommandEnv, DryRunFormat, GroupTempDir};
use scr::host::os::OsHost;
use scr::host::{Clock, ProcessHost, SystemClock};
use scr::privilege::{OsUserLookup, PrivilegeCapability};
use scr::verify::VerificationManager;

/// Not a CLI flag (spec §4.1): every deployment keeps its recorded hashes
/// under this fixed path.
const DEFAULT_HASH_DIR: &str = "/usr/local/etc/scr/hashes";

/// Cancellation state an operator SIGINT drives: 0 none, 1 requested (grace
/// period), 2 immediate (second SIGINT skips the grace period, spec §5).
static CANCEL: AtomicU8 = AtomicU8::new(0);

extern "C" fn handle_sigint(_sig: libc::c_int) {
    if CANCEL.load(Ordering::SeqCst) == 0 {
        CANCEL.store(1, Ordering::SeqCst);
    } else {
        CANCEL.store(2, Ordering::SeqCst);
    }
}

fn install_sigint_handler() {
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
    }
}

fn cancel_state() -> CancelState {
    match CANCEL.load(Ordering::SeqCst) {
        0 => CancelState::None,
        1 => CancelState::Requested,
        _ => CancelState::Immediate,
    }
}

fn generate_run_id() -> String {
    format!("{:08x}", rand::random::<u32>())
}

fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    install_sigint_handler();

    let manifest_path_buf = match std::fs::canonicalize(&cli.config) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("error: cannot resolve config path {}: {e}", cli.config.display());
            return 1;
        }
    };
    let manifest_text = match std::fs::read_to_string(&manifest_path_buf) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("error: cannot read {}: {e}", manifest_path_buf.display());
            return 1;
        }
    };
    let manifest_path =
        ResolvedPath::new(&manifest_path_buf).expect("a canonicalized path is always absolute");

    let host: Arc<dyn ProcessHost> = Arc::new(OsHost::default());
    let clock = SystemClock;
    let system_env = host.read_system_env();
    let privilege = PrivilegeCapability::detect();
    let user_lookup = OsUserLookup;

    let run_id = cli.run_id.clone().unwrap_or_else(generate_run_id);
    let logger = match &cli.log_dir {
        Some(dir) => match AuditLogger::to_dir(dir, run_id.clone(), cli.show_sensitive) {
            Ok(l) => l,
            Err(e) => {
                eprintln!("error: cannot open audit log directory: {e}");
                return 1;
            }
        },
        None => AuditLogger::to_stderr(run_id.clone(), cli.show_sensitive),
    };

    // `--validate` always runs the manifest through full (non-dry-run)
    // verification, even if `--dry-run` was also given: it asks "is this
    // manifest correct", not "what would running it do".
    let load_dry_run = cli.dry_run && !cli.validate;
    let hash_dir = ResolvedPath::new(DEFAULT_HASH_DIR).expect("fixed hash dir path is well-formed");
    let loaded = match load_config(&manifest_text, &manifest_path, host.clone(), &clock, hash_dir, load_dry_run) {
        Ok(l) => l,
        Err(e) => {
            logger.record_note(&format!("fatal: {e}"));
            logger.notify_fatal(&RunSummary { run_id: run_id.clone(), exit_code: 1, message: e.to_string() });
            eprintln!("error: {e}");
            return 1;
        }
    };

    if cli.validate {
        let failed = loaded.verification.iter().filter(|r| r.is_failed()).count();
        println!(
            "manifest OK: {} group(s), {} verification check(s), {} failed",
            loaded.tree.groups.len(),
            loaded.verification.len(),
            failed
        );
        return 0;
    }

    if cli.dry_run {
        let store = HashStore::new(
            ResolvedPath::new(DEFAULT_HASH_DIR).expect("fixed hash dir path is well-formed"),
            host.clone(),
        );
        let manager = VerificationManager::new(store, host.clone(), loaded.tree.global.verify_standard_paths);
        let report = match run_dry_run(&loaded.tree, &manager, host.as_ref(), &system_env) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("error: {e}");
                return 1;
            }
        };
        match DryRunFormat::from(cli.dry_run_format) {
            DryRunFormat::Json => match report.to_json() {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("error: {e}");
                    return 1;
                }
            },
            DryRunFormat::Text => print!("{}", report.to_text(cli.dry_run_detail.into())),
        }
        return 0;
    }

    let store = HashStore::new(
        ResolvedPath::new(DEFAULT_HASH_DIR).expect("fixed hash dir path is well-formed"),
        host.clone(),
    );
    let manager = VerificationManager::new(store, host.clone(), loaded.tree.global.verify_standard_paths);
    let ctx = CommandEnv {
        host: host.as_ref(),
        privilege: &privilege,
        user_lookup: &user_lookup,
        manager: &manager,
        system_env: &system_env,
    };

    let mut any_failure = false;
    let mut cancelled = false;

    for group in loaded.tree.groups_in_order() {
        if matches!(cancel_state(), CancelState::Immediate) {
            logger.record_note(&format!("group '{}': run cancelled before it started", group.name));
            cancelled = true;
            continue;
        }

        let datetime = clock.now().format("%Y%m%d_%H%M%S").to_string();
        let rand_suffix = format!("{:04x}", rand::random::<u16>());
        let temp_path = match scr::exec::temp_dir_path(&group.name, &datetime, &rand_suffix) {
            Ok(p) => p,
            Err(e) => {
                logger.record_note(&format!("group '{}': cannot build temp dir path: {e}", group.name));
                any_failure = true;
                continue;
            }
        };

        // A group with an explicit workdir never needs an auto temp dir
        // (spec §4.5 step 1, data model §3): skip the real mkdir entirely.
        // `temp_path` is still passed through as `group_temp_dir` but
        // `resolve_workdir` never touches it once `group.workdir` wins.
        let mut created_temp: Option<GroupTempDir> = None;
        let group_temp_dir = if group.workdir.is_some() {
            temp_path
        } else {
            match GroupTempDir::create(temp_path, host.as_ref(), cli.keep_temp_dirs) {
                Ok(d) => {
                    let path = d.path().clone();
                    created_temp = Some(d);
                    path
                }
                Err(e) => {
                    logger.record_note(&format!("group '{}': cannot create temp dir: {e}", group.name));
                    any_failure = true;
                    continue;
                }
            }
        };

        for command in &group.commands {
            if matches!(cancel_state(), CancelState::Immediate) {
                logger.record_note(&format!("group '{}': cancelled, skipping remaining commands", group.name));
                cancelled = true;
                break;
            }

            let heartbeat = |elapsed: std::time::Duration| {
                logger.record_heartbeat(&group.name, &command.name, elapsed);
            };
            let outcome = run_command(
                &ctx,
                &loaded.tree.global,
                group,
                command,
                &group.name,
                &group_temp_dir,
                &cancel_state,
                &heartbeat,
            );
            match outcome {
                Ok(outcome) => {
                    let succeeded = outcome.succeeded();
                    logger.record_command(&group.name, &outcome);
                    if !succeeded {
                        if outcome.cancelled {
                            cancelled = true;
                        } else {
                            any_failure = true;
                        }
                        break;
                    }
                }
                Err(e) => {
                    logger.record_note(&format!("group '{}' command '{}': {e}", group.name, command.name));
                    any_failure = true;
                    break;
                }
            }
        }

        if let Some(d) = &created_temp {
            if let Err(e) = d.cleanup(host.as_ref()) {
                logger.record_note(&format!("group '{}': temp dir cleanup failed: {e}", group.name));
            }
        }
    }

    if cancelled {
        logger.notify_fatal(&RunSummary {
            run_id: run_id.clone(),
            exit_code: 130,
            message: "run interrupted".to_string(),
        });
        130
    } else if any_failure {
        logger.notify_fatal(&RunSummary {
            run_id: run_id.clone(),
            exit_code: 2,
            message: "one or more commands failed".to_string(),
        });
        2
    } else {
        0
    }
}
