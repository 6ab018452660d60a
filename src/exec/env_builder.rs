//! Layered child environment assembly (spec §4.5 step 5): system env
//! filtered by the allowlist, then global, group, command `expanded_env`,
//! each layer overriding the keys set by the one before it.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::config::{CommandConfig, GlobalConfig, GroupConfig};

/// System environment filtered by the allowlist, then each layer in turn
/// overriding the keys the previous layers set. Shared by the load-time
/// `build_child_env` and execution's re-expanded command env (spec §4.5
/// step 2 can change `command.expanded_env` values after `__runner_workdir`
/// is known, so the command layer isn't always `command.expanded_env`
/// itself).
pub fn layer_env(
    system_env: &HashMap<String, String>,
    env_allowed: &HashSet<String>,
    layers: &[&IndexMap<String, String>],
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = system_env
        .iter()
        .filter(|(k, _)| env_allowed.contains(k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for layer in layers {
        for (k, v) in *layer {
            env.insert(k.clone(), v.clone());
        }
    }
    env
}

pub fn build_child_env(
    system_env: &HashMap<String, String>,
    env_allowed: &HashSet<String>,
    global: &GlobalConfig,
    group: &GroupConfig,
    command: &CommandConfig,
) -> HashMap<String, String> {
    layer_env(
        system_env,
        env_allowed,
        &[&global.expanded_env, &group.expanded_env, &command.expanded_env],
    )
}
