//! Effective timeout resolution (spec §4.5 step 6): first set value of
//! command, group, global, else a system default, with the winning level
//! recorded for dry-run reporting.

use crate::config::Timeout;

pub const SYSTEM_DEFAULT_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveTimeout {
    pub seconds: u64,
    pub source: &'static str,
}

impl EffectiveTimeout {
    pub fn unlimited(&self) -> bool {
        self.seconds == 0
    }
}

pub fn resolve(command: Timeout, group: Timeout, global: Timeout) -> EffectiveTimeout {
    let (seconds, source) = crate::config::tree::resolve_effective_timeout(
        command,
        group,
        global,
        SYSTEM_DEFAULT_TIMEOUT_SECS,
    );
    EffectiveTimeout { seconds, source }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_level_wins_when_set() {
        let eff = resolve(Timeout::parse(Some(10), &crate::error::Scope::Global).unwrap(), Timeout::inherit(), Timeout::inherit());
        assert_eq!(eff.seconds, 10);
        assert_eq!(eff.source, "command");
    }

    #[test]
    fn zero_means_unlimited() {
        let eff = resolve(Timeout::parse(Some(0), &crate::error::Scope::Global).unwrap(), Timeout::inherit(), Timeout::inherit());
        assert!(eff.unlimited());
    }

    #[test]
    fn falls_back_to_system_default() {
        let eff = resolve(Timeout::inherit(), Timeout::inherit(), Timeout::inherit());
        assert_eq!(eff.seconds, SYSTEM_DEFAULT_TIMEOUT_SECS);
        assert_eq!(eff.source, "system default");
    }
}
