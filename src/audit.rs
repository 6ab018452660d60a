//! Audit logger (spec §5/§6/§7): one structured, redacted, key=value line
//! per command, written through a single serialized sink (spec §9: "the
//! audit logger is the only legitimate process-wide sink").

use std::fmt::Write as _;
use std::io::Write;
use std::sync::Mutex;

use crate::error::Result;
use crate::exec::CommandOutcome;

/// Patterns that mark a variable name as sensitive (spec §7). Matching is
/// case-insensitive substring containment, e.g. `DB_PASSWORD` matches
/// `*PASSWORD*`.
const SENSITIVE_PATTERNS: &[&str] = &["PASSWORD", "SECRET", "TOKEN", "KEY", "CREDENTIAL", "AUTH"];

pub fn is_sensitive_name(name: &str) -> bool {
    let upper = name.to_uppercase();
    SENSITIVE_PATTERNS.iter().any(|p| upper.contains(p))
}

/// Redact `value` if `name` looks sensitive, unless `show_sensitive` was
/// requested on the CLI.
pub fn redact<'a>(name: &str, value: &'a str, show_sensitive: bool) -> &'a str {
    if !show_sensitive && is_sensitive_name(name) {
        "[REDACTED]"
    } else {
        value
    }
}

/// Where the audit sink writes. Production picks `File` when `--log-dir` is
/// given, else falls back to stderr; tests write into an in-memory buffer.
enum Sink {
    Stderr,
    File(std::fs::File),
    #[cfg(test)]
    Buffer(Vec<u8>),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Sink::Stderr => std::io::stderr().write(buf),
            Sink::File(f) => f.write(buf),
            #[cfg(test)]
            Sink::Buffer(b) => b.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Sink::Stderr => std::io::stderr().flush(),
            Sink::File(f) => f.flush(),
            #[cfg(test)]
            Sink::Buffer(b) => b.flush(),
        }
    }
}

/// One process-wide audit sink, serialized behind a mutex (spec §5: "the
/// only shared mutable state is ... the audit logger").
pub struct AuditLogger {
    sink: Mutex<Sink>,
    run_id: String,
    show_sensitive: bool,
    slack: Box<dyn SlackSink>,
}

impl AuditLogger {
    pub fn to_stderr(run_id: String, show_sensitive: bool) -> Self {
        Self {
            sink: Mutex::new(Sink::Stderr),
            run_id,
            show_sensitive,
            slack: Box::new(NoopSlackSink),
        }
    }

    /// `log_dir`, when given, is a directory; the logger appends to
    /// `<log_dir>/<run_id>.log` inside it.
    pub fn to_dir(log_dir: &std::path::Path, run_id: String, show_sensitive: bool) -> Result<Self> {
        std::fs::create_dir_all(log_dir).map_err(|e| crate::error::Error::Io {
            path: log_dir.to_string_lossy().to_string(),
            source: e,
        })?;
        let path = log_dir.join(format!("{run_id}.log"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| crate::error::Error::Io { path: path.to_string_lossy().to_string(), source: e })?;
        Ok(Self {
            sink: Mutex::new(Sink::File(file)),
            run_id,
            show_sensitive,
            slack: Box::new(NoopSlackSink),
        })
    }

    #[cfg(test)]
    pub fn to_buffer(run_id: String, show_sensitive: bool) -> Self {
        Self {
            sink: Mutex::new(Sink::Buffer(Vec::new())),
            run_id,
            show_sensitive,
            slack: Box::new(NoopSlackSink),
        }
    }

    pub fn with_slack_sink(mut self, slack: Box<dyn SlackSink>) -> Self {
        self.slack = slack;
        self
    }

    #[cfg(test)]
    pub fn buffer_contents(&self) -> String {
        let sink = self.sink.lock().unwrap();
        match &*sink {
            Sink::Buffer(b) => String::from_utf8_lossy(b).to_string(),
            _ => String::new(),
        }
    }

    /// Format and write one audit line for a finished command (spec §6
    /// "Persisted state written": run-id, group, command, cmd, args summary,
    /// outcome, duration).
    pub fn record_command(&self, group: &str, outcome: &CommandOutcome) {
        let mut line = String::new();
        let _ = write!(
            line,
            "run_id={} group={} command={} cmd={} args=\"{}\" outcome={} exit_code={} duration_ms={} timed_out={} cancelled={}",
            self.run_id,
            group,
            outcome.command,
            shell_escape(&outcome.resolved_cmd),
            redact_args(&outcome.args, self.show_sensitive),
            if outcome.succeeded() { "success" } else { "failure" },
            outcome.exit_status.map(|s| s.code()).unwrap_or(-1),
            outcome.duration.as_millis(),
            outcome.timed_out,
            outcome.cancelled,
        );
        self.write_line(&line);
    }

    /// Periodic heartbeat for unlimited-timeout commands (spec §4.5 step 9:
    /// "emit a periodic audit line every 60s of wall time").
    pub fn record_heartbeat(&self, group: &str, command: &str, elapsed: std::time::Duration) {
        let line = format!(
            "run_id={} group={} command={} event=heartbeat elapsed_s={}",
            self.run_id,
            group,
            command,
            elapsed.as_secs()
        );
        self.write_line(&line);
    }

    pub fn record_note(&self, note: &str) {
        let line = format!("run_id={} event=note message=\"{}\"", self.run_id, note.replace('"', "'"));
        self.write_line(&line);
    }

    fn write_line(&self, line: &str) {
        let mut sink = self.sink.lock().unwrap();
        let _ = writeln!(sink, "{line}");
        let _ = sink.flush();
    }

    /// Notify the configured Slack sink of a fatal run outcome (spec §6:
    /// `GSCR_SLACK_WEBHOOK_URL` routes fatal summaries).
    pub fn notify_fatal(&self, summary: &RunSummary) {
        self.slack.notify(summary);
    }
}

fn redact_args(args: &[String], show_sensitive: bool) -> String {
    args.iter()
        .map(|a| {
            if let Some((name, value)) = a.split_once('=') {
                if !show_sensitive && is_sensitive_name(name) {
                    return format!("{name}=[REDACTED]");
                }
            }
            shell_escape(a)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_escape(s: &str) -> String {
    if s.chars().all(|c| c.is_alphanumeric() || "-_./:".contains(c)) {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Summary handed to a fatal-run notification (spec §6: a fatal run
/// summary, exit 1 or 2, may additionally be POSTed to Slack).
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub exit_code: i32,
    pub message: String,
}

/// Delivering an audit summary to Slack is an out-of-scope external
/// collaborator (spec §1): the core only owns the decision of *when* to
/// notify, not the HTTP POST itself.
pub trait SlackSink: Send + Sync {
    fn notify(&self, summary: &RunSummary);
}

pub struct NoopSlackSink;

impl SlackSink for NoopSlackSink {
    fn notify(&self, _summary: &RunSummary) {}
}

/// Reads `GSCR_SLACK_WEBHOOK_URL` from the environment; `Some` just means a
/// webhook was configured, not that delivery is implemented here.
pub fn slack_webhook_configured(system_env: &std::collections::HashMap<String, String>) -> Option<&str> {
    system_env.get("GSCR_SLACK_WEBHOOK_URL").map(|s| s.as_str())
}
