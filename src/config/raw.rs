//! Raw manifest shape: plain serde structs mirroring the TOML document
//! before any expansion or validation. Field spelling is normative (spec
//! §6); deprecated names are rejected with a remediation hint rather than
//! silently ignored.

use serde::Deserialize;
use toml::Value;

use crate::error::{Error, Result};

/// `(deprecated name, current name)`, scanned against every table in the
/// document before typed deserialization runs.
const DEPRECATED_FIELDS: &[(&str, &str)] = &[
    ("env", "env_vars"),
    ("env_allowlist", "env_allowed"),
    ("from_env", "env_import"),
    ("dir", "workdir"),
    ("temp_dir", "workdir"),
    ("max_output_size", "output_size_limit"),
    ("max_risk_level", "risk_level"),
];

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RawGlobal {
    pub timeout: Option<i64>,
    pub log_level: Option<String>,
    pub verify_files: Vec<String>,
    #[serde(default = "default_true")]
    pub verify_standard_paths: bool,
    pub env_allowed: Vec<String>,
    pub env_import: Vec<String>,
    pub vars: Vec<String>,
    pub env_vars: Vec<String>,
    pub output_size_limit: Option<u64>,
}

impl Default for RawGlobal {
    fn default() -> Self {
        RawGlobal {
            timeout: None,
            log_level: None,
            verify_files: Vec::new(),
            verify_standard_paths: true,
            env_allowed: Vec::new(),
            env_import: Vec::new(),
            vars: Vec::new(),
            env_vars: Vec::new(),
            output_size_limit: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct RawCommand {
    pub name: String,
    pub cmd: String,
    pub args: Vec<String>,
    pub workdir: Option<String>,
    pub timeout: Option<i64>,
    pub risk_level: Option<String>,
    pub run_as_user: Option<String>,
    pub run_as_group: Option<String>,
    pub output_file: Option<String>,
    pub env_vars: Vec<String>,
    pub vars: Vec<String>,
    pub env_import: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct RawGroup {
    pub name: String,
    pub description: Option<String>,
    pub priority: i64,
    pub workdir: Option<String>,
    pub timeout: Option<i64>,
    pub verify_files: Vec<String>,
    pub env_allowed: Vec<String>,
    pub env_import: Vec<String>,
    pub vars: Vec<String>,
    pub env_vars: Vec<String>,
    pub commands: Vec<RawCommand>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct RawManifest {
    pub global: RawGlobal,
    pub groups: Vec<RawGroup>,
}

/// Parse manifest bytes into the raw document shape. Runs the deprecated-
/// field scan against the untyped `toml::Value` first so the error names
/// the specific old spelling, then deserializes into the typed structs
/// (`deny_unknown_fields` is the backstop for anything the scan missed).
pub fn parse(text: &str) -> Result<RawManifest> {
    let value: Value = toml::from_str(text).map_err(|e| Error::InvalidPath {
        path: "<manifest>".into(),
        reason: format!("TOML syntax error: {e}"),
    })?;
    scan_deprecated(&value, "")?;
    Value::try_into(value).map_err(|e: toml::de::Error| Error::UnknownField {
        field: "<manifest>".into(),
        remediation: format!("manifest does not match the expected shape: {e}"),
    })
}

fn scan_deprecated(value: &Value, path: &str) -> Result<()> {
    match value {
        Value::Table(table) => {
            for (key, child) in table {
                if let Some((_, replacement)) = DEPRECATED_FIELDS.iter().find(|(old, _)| old == key) {
                    return Err(Error::UnknownField {
                        field: format!("{path}{key}"),
                        remediation: format!("use '{replacement}' instead"),
                    });
                }
                scan_deprecated(child, &format!("{path}{key}."))?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                scan_deprecated(item, path)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_manifest() {
        let text = r#"
            [global]
            env_allowed = ["HOME"]

            [[groups]]
            name = "build"

            [[groups.commands]]
            name = "compile"
            cmd = "make"
        "#;
        let manifest = parse(text).unwrap();
        assert_eq!(manifest.global.env_allowed, vec!["HOME".to_string()]);
        assert_eq!(manifest.groups.len(), 1);
        assert_eq!(manifest.groups[0].commands[0].cmd, "make");
    }

    #[test]
    fn rejects_deprecated_env_field() {
        let text = r#"
            [global]
            env = ["X=1"]
        "#;
        let err = parse(text).unwrap_err();
        match err {
            Error::UnknownField { field, remediation } => {
                assert_eq!(field, "global.env");
                assert!(remediation.contains("env_vars"));
            }
            other => panic!("expected UnknownField, got {other:?}"),
        }
    }

    #[test]
    fn rejects_deprecated_from_env_field() {
        let text = r#"
            [global]
            from_env = ["home=HOME"]
        "#;
        let err = parse(text).unwrap_err();
        assert!(matches!(err, Error::UnknownField { .. }));
    }

    #[test]
    fn rejects_truly_unknown_field() {
        let text = r#"
            [global]
            bogus_field = true
        "#;
        assert!(parse(text).is_err());
    }

    #[test]
    fn defaults_apply_when_fields_absent() {
        let manifest = parse("[global]\n").unwrap();
        assert!(manifest.global.verify_standard_paths);
        assert!(manifest.global.vars.is_empty());
    }
}
