//! C4: static risk classifier.
//!
//! Classifies a fully-resolved command line into one of four risk tiers
//! using a fixed table of regexes, precompiled once. A command's declared
//! `risk_level` is the *maximum acceptable* tag; if the classifier returns
//! something higher, the command is rejected before it ever runs.

use lazy_static::lazy_static;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

struct RiskRule {
    pattern: Regex,
    level: RiskLevel,
    #[allow(dead_code)]
    description: &'static str,
}

lazy_static! {
    static ref RISK_RULES: Vec<RiskRule> = vec![
        RiskRule {
            pattern: Regex::new(r"\brm\s+(-\w*r\w*f\w*|-\w*f\w*r\w*)\s+/\s*$").unwrap(),
            level: RiskLevel::Critical,
            description: "recursive forced delete of the filesystem root",
        },
        RiskRule {
            pattern: Regex::new(r"(curl|wget)\s+[^|]*\|\s*(sudo\s+)?(ba)?sh\b").unwrap(),
            level: RiskLevel::Critical,
            description: "pipe a remote download straight into a shell",
        },
        RiskRule {
            pattern: Regex::new(r"\bmkfs(\.\w+)?\b").unwrap(),
            level: RiskLevel::Critical,
            description: "reformat a filesystem",
        },
        RiskRule {
            pattern: Regex::new(r"\bdd\b.*\bof=/dev/").unwrap(),
            level: RiskLevel::Critical,
            description: "write raw bytes to a block device",
        },
        RiskRule {
            pattern: Regex::new(r"\b(sudo|doas|pkexec)\b").unwrap(),
            level: RiskLevel::High,
            description: "run as another (likely privileged) user",
        },
        RiskRule {
            pattern: Regex::new(r"\bchmod\s+(-R\s+)?0?777\b").unwrap(),
            level: RiskLevel::High,
            description: "grant world read/write/execute",
        },
        RiskRule {
            pattern: Regex::new(r"\brm\s+-\w*r\w*f?\w*\s+/etc\b").unwrap(),
            level: RiskLevel::High,
            description: "recursive delete under /etc",
        },
        RiskRule {
            pattern: Regex::new(r">\s*/etc/").unwrap(),
            level: RiskLevel::Medium,
            description: "redirect output into /etc",
        },
        RiskRule {
            pattern: Regex::new(r"\brm\s+-\w*f\w*").unwrap(),
            level: RiskLevel::Medium,
            description: "forced delete",
        },
        RiskRule {
            pattern: Regex::new(r":\(\)\s*\{.*\};").unwrap(),
            level: RiskLevel::Critical,
            description: "fork-bomb shaped function definition",
        },
    ];
}

/// Classify a fully-expanded command line (`cmd` plus its joined `args`) and
/// return the highest-severity tag that matches, or `Low` if nothing matches.
pub fn classify(cmd: &str, args: &[String]) -> RiskLevel {
    let line = if args.is_empty() {
        cmd.to_string()
    } else {
        format!("{cmd} {}", args.join(" "))
    };
    RISK_RULES
        .iter()
        .filter(|rule| rule.pattern.is_match(&line))
        .map(|rule| rule.level)
        .max()
        .unwrap_or(RiskLevel::Low)
}
