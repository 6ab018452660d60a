//! Command-line surface (spec §6): the nine flags that materially affect
//! the core. Flag-parsing mechanics are `clap`'s concern; the semantics
//! they drive live in `main.rs`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::exec::{DryRunDetail, DryRunFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DryRunFormatArg {
    Text,
    Json,
}

impl From<DryRunFormatArg> for DryRunFormat {
    fn from(v: DryRunFormatArg) -> Self {
        match v {
            DryRunFormatArg::Text => DryRunFormat::Text,
            DryRunFormatArg::Json => DryRunFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DryRunDetailArg {
    Summary,
    Detailed,
    Full,
}

impl From<DryRunDetailArg> for DryRunDetail {
    fn from(v: DryRunDetailArg) -> Self {
        match v {
            DryRunDetailArg::Summary => DryRunDetail::Summary,
            DryRunDetailArg::Detailed => DryRunDetail::Detailed,
            DryRunDetailArg::Full => DryRunDetail::Full,
        }
    }
}

/// Secure batch command runner: hash-verified, variable-expanded,
/// privilege-aware execution of a manifest's command groups.
#[derive(Debug, Parser)]
#[command(name = "scr", version, about)]
pub struct Cli {
    /// Path to the manifest TOML file.
    #[arg(long)]
    pub config: PathBuf,

    /// Produce a side-effect-free plan instead of executing anything.
    #[arg(long)]
    pub dry_run: bool,

    #[arg(long, value_enum, default_value_t = DryRunFormatArg::Text)]
    pub dry_run_format: DryRunFormatArg,

    #[arg(long, value_enum, default_value_t = DryRunDetailArg::Summary)]
    pub dry_run_detail: DryRunDetailArg,

    /// Load and validate the manifest, then exit without running anything.
    #[arg(long)]
    pub validate: bool,

    /// Don't remove per-group temp dirs after the group finishes.
    #[arg(long)]
    pub keep_temp_dirs: bool,

    /// Disable redaction of values whose variable name looks sensitive.
    #[arg(long)]
    pub show_sensitive: bool,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Directory to write the audit log into; defaults to stderr.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Identifier stamped onto every audit line for this invocation;
    /// defaults to a generated one if omitted.
    #[arg(long)]
    pub run_id: Option<String>,
}

impl Default for DryRunFormatArg {
    fn default() -> Self {
        DryRunFormatArg::Text
    }
}

impl Default for DryRunDetailArg {
    fn default() -> Self {
        DryRunDetailArg::Summary
    }
}

impl std::fmt::Display for DryRunFormatArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DryRunFormatArg::Text => write!(f, "text"),
            DryRunFormatArg::Json => write!(f, "json"),
        }
    }
}

impl std::fmt::Display for DryRunDetailArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DryRunDetailArg::Summary => write!(f, "summary"),
            DryRunDetailArg::Detailed => write!(f, "detailed"),
            DryRunDetailArg::Full => write!(f, "full"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invocation() {
        let cli = Cli::parse_from(["scr", "--config", "/etc/scr/manifest.toml"]);
        assert_eq!(cli.config, PathBuf::from("/etc/scr/manifest.toml"));
        assert!(!cli.dry_run);
        assert_eq!(cli.dry_run_format, DryRunFormatArg::Text);
        assert_eq!(cli.dry_run_detail, DryRunDetailArg::Summary);
        assert!(!cli.validate);
        assert!(!cli.keep_temp_dirs);
        assert!(!cli.show_sensitive);
        assert_eq!(cli.log_level, "info");
        assert!(cli.log_dir.is_none());
        assert!(cli.run_id.is_none());
    }

    #[test]
    fn parses_dry_run_flags() {
        let cli = Cli::parse_from([
            "scr",
            "--config",
            "m.toml",
            "--dry-run",
            "--dry-run-format",
            "json",
            "--dry-run-detail",
            "full",
        ]);
        assert!(cli.dry_run);
        assert_eq!(cli.dry_run_format, DryRunFormatArg::Json);
        assert_eq!(cli.dry_run_detail, DryRunDetailArg::Full);
    }
}
