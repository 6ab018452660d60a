//! C3: the two-phase expansion engine. Runs `from_env` -> `vars` ->
//! `env_vars` -> `verify_files` for one scope, given the parent scope's
//! already-resolved `expanded_vars`.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::codec::ResolvedPath;
use crate::error::{Error, Result, Scope};
use crate::expand::scope::VarScope;
use crate::expand::template::Template;

pub const MAX_CYCLE_ROUNDS: usize = 15;

/// One `name = value` or `internal = SYSTEM` manifest entry, split on the
/// first `=`.
pub fn split_kv(entry: &str) -> Option<(&str, &str)> {
    let idx = entry.find('=')?;
    Some((&entry[..idx], &entry[idx + 1..]))
}

/// Automatic variables available to every scope's expansion. `workdir` is
/// `None` at the global/group level (it's only known once a command's
/// working directory has been resolved) and `Some` when re-expanding a
/// command at execution time.
pub fn automatic_vars(datetime: &str, pid: u32, workdir: Option<&str>) -> IndexMap<String, String> {
    let mut vars = IndexMap::new();
    vars.insert("__runner_datetime".to_string(), datetime.to_string());
    vars.insert("__runner_pid".to_string(), pid.to_string());
    if let Some(wd) = workdir {
        vars.insert("__runner_workdir".to_string(), wd.to_string());
    }
    vars
}

/// Validate that a defined variable's name is legal and assigned to the
/// right scope rule (global names only at `Scope::Global`, local names only
/// at group/command scopes).
fn validate_definition_scope(name: &str, scope: &Scope) -> Result<()> {
    match VarScope::classify(name) {
        None => Err(Error::InvalidVariableName { name: name.to_string(), scope: scope.clone() }),
        Some(VarScope::Reserved) => {
            Err(Error::ReservedVariableName { name: name.to_string(), scope: scope.clone() })
        }
        Some(VarScope::Global) => {
            if matches!(scope, Scope::Global) {
                Ok(())
            } else {
                Err(Error::ScopeMismatch {
                    name: name.to_string(),
                    scope: scope.clone(),
                    reason: "global-scope (uppercase) names may only be defined in [global]".into(),
                })
            }
        }
        Some(VarScope::Local) => {
            if matches!(scope, Scope::Global) {
                Err(Error::ScopeMismatch {
                    name: name.to_string(),
                    scope: scope.clone(),
                    reason: "local-scope (lowercase) names may not be defined in [global]".into(),
                })
            } else {
                Ok(())
            }
        }
    }
}

/// The effective `env_allowed` allowlist for a scope is the union of its own
/// list with everything its ancestors already allowed — a name allowed at
/// global scope stays usable via `env_import` in a nested group/command.
pub fn effective_env_allowed(ancestor_allowed: &HashSet<String>, own_allowed: &[String]) -> HashSet<String> {
    let mut set = ancestor_allowed.clone();
    set.extend(own_allowed.iter().cloned());
    set
}

/// Result of resolving one scope's `from_env`/`vars`/`env_vars`/`verify_files`.
#[derive(Debug, Clone, Default)]
pub struct ExpandedScope {
    /// This scope's `expanded_vars`, already merged with the parent's.
    pub vars: IndexMap<String, String>,
    /// This scope's own `expanded_env` (never merged with the parent's —
    /// layering child envs is the execution assembler's job, §4.5).
    pub env: IndexMap<String, String>,
    pub verify_files: Vec<ResolvedPath>,
    pub warnings: Vec<String>,
}

pub struct ScopeInputs<'a> {
    pub scope: Scope,
    pub env_import: &'a [String],
    pub vars: &'a [String],
    pub env_vars: &'a [String],
    pub verify_files: &'a [String],
}

/// Run the full four-step expansion for one scope.
pub fn expand_scope(
    input: &ScopeInputs,
    parent_vars: &IndexMap<String, String>,
    automatic: &IndexMap<String, String>,
    effective_allowed: &HashSet<String>,
    system_env: &HashMap<String, String>,
) -> Result<ExpandedScope> {
    let scope = &input.scope;
    let mut warnings = Vec::new();

    // Seed: parent's expanded_vars (includes automatic vars from the root),
    // plus — only at the true root call — the automatic vars themselves.
    let mut vars: IndexMap<String, String> = parent_vars.clone();
    for (k, v) in automatic {
        vars.entry(k.clone()).or_insert_with(|| v.clone());
    }

    // Step 1: from_env (merge, child overrides same-name parent entries).
    for entry in input.env_import {
        let (internal, system_name) = split_kv(entry).ok_or_else(|| Error::InvalidPath {
            path: entry.clone(),
            reason: "env_import entries must be 'internal=SYSTEM'".into(),
        })?;
        validate_definition_scope(internal, scope)?;
        if !effective_allowed.contains(system_name) {
            return Err(Error::VariableNotInAllowlist {
                name: system_name.to_string(),
                scope: scope.clone(),
            });
        }
        let value = match system_env.get(system_name) {
            Some(v) => v.clone(),
            None => {
                warnings.push(format!(
                    "from_env: system variable '{system_name}' is unset; binding '{internal}' to empty string"
                ));
                String::new()
            }
        };
        vars.insert(internal.to_string(), value);
    }

    // Step 2: vars, evaluated with recursive substitution + cycle detection.
    let own_vars: IndexMap<String, String> = input
        .vars
        .iter()
        .map(|entry| {
            split_kv(entry).map(|(k, v)| (k.to_string(), v.to_string())).ok_or_else(|| Error::InvalidPath {
                path: entry.clone(),
                reason: "vars entries must be 'name=value'".into(),
            })
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .collect();

    for name in own_vars.keys() {
        validate_definition_scope(name, scope)?;
    }

    let mut resolved: IndexMap<String, String> = IndexMap::new();
    for name in own_vars.keys() {
        resolve_var(name, &own_vars, &mut vars, &mut resolved, &mut Vec::new(), scope, 0)?;
    }
    for (k, v) in resolved {
        vars.insert(k, v);
    }

    // Step 3: env_vars, templated against `vars` only.
    let mut env = IndexMap::new();
    for entry in input.env_vars {
        let (name, value_tpl) = split_kv(entry).ok_or_else(|| Error::InvalidPath {
            path: entry.clone(),
            reason: "env_vars entries must be 'NAME=value'".into(),
        })?;
        if !is_posix_env_name(name) {
            return Err(Error::InvalidVariableName { name: name.to_string(), scope: scope.clone() });
        }
        let template = Template::parse(value_tpl, scope)?;
        let value = template.expand(&vars, scope)?;
        env.insert(name.to_string(), value);
    }

    // Step 4: verify_files, templated against `vars`.
    let mut verify_files = Vec::new();
    for entry in input.verify_files {
        let template = Template::parse(entry, scope)?;
        let expanded = template.expand(&vars, scope)?;
        verify_files.push(ResolvedPath::new(&expanded)?);
    }

    Ok(ExpandedScope { vars, env, verify_files, warnings })
}

/// Template validation pass (§4.3): `cmd`/`args`/`env_vars` values/`workdir`
/// may not reference a local-scope name unless it is defined directly in
/// this command's own `vars` — inherited group/global locals must flow in
/// indirectly via the already-substituted string, not by direct reference.
pub fn validate_template_local_references(
    scope: &Scope,
    field: &str,
    template: &Template,
    command_own_vars: &HashSet<String>,
) -> Result<()> {
    for name in template.references() {
        if let Some(VarScope::Local) = VarScope::classify(name) {
            if !command_own_vars.contains(name) {
                return Err(Error::TemplateLocalReference {
                    name: name.to_string(),
                    field: field.to_string(),
                    scope: scope.clone(),
                });
            }
        }
    }
    Ok(())
}

fn is_posix_env_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().next().map(|c| c.is_ascii_alphabetic() || c == '_').unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Recursively resolve `name` from `own_vars` (this scope's own `vars`
/// entries), consulting `vars` (parent-plus-already-resolved) first so a
/// self-referencing extension like `path = %{path}:/new` picks up the
/// enclosing scope's value rather than looping.
fn resolve_var(
    name: &str,
    own_vars: &IndexMap<String, String>,
    vars: &mut IndexMap<String, String>,
    resolved: &mut IndexMap<String, String>,
    resolving: &mut Vec<String>,
    scope: &Scope,
    depth: usize,
) -> Result<String> {
    if let Some(v) = vars.get(name) {
        return Ok(v.clone());
    }
    if let Some(v) = resolved.get(name) {
        return Ok(v.clone());
    }
    let Some(raw) = own_vars.get(name) else {
        return Err(Error::UndefinedVariable { name: name.to_string(), scope: scope.clone() });
    };
    if resolving.contains(&name.to_string()) {
        let mut chain = resolving.clone();
        chain.push(name.to_string());
        return Err(Error::CircularReference { scope: scope.clone(), chain });
    }
    if depth >= MAX_CYCLE_ROUNDS {
        let mut chain = resolving.clone();
        chain.push(name.to_string());
        return Err(Error::CircularReference { scope: scope.clone(), chain });
    }

    resolving.push(name.to_string());
    let template = Template::parse(raw, scope)?;
    for part_name in template.references() {
        if vars.contains_key(part_name) || resolved.contains_key(part_name) {
            continue;
        }
        if own_vars.contains_key(part_name) {
            let value = resolve_var(part_name, own_vars, vars, resolved, resolving, scope, depth + 1)?;
            resolved.insert(part_name.to_string(), value);
        }
    }
    let mut lookup = vars.clone();
    for (k, v) in resolved.iter() {
        lookup.entry(k.clone()).or_insert_with(|| v.clone());
    }
    let value = template.expand(&lookup, scope)?;
    resolving.pop();
    resolved.insert(name.to_string(), value.clone());
    Ok(value)
}
