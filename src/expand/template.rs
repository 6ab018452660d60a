//! Template parsing: `%{NAME}` references, `\%`/`\\` escapes, and eager
//! detection of the deprecated `${NAME}` syntax.

use indexmap::IndexMap;

use crate::error::{Error, Result, Scope};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Reference(String),
}

/// A parsed template. Keeps the original source alongside the parsed parts
/// so a later pass can re-scan `cmd`/`args`/`env_vars`/`workdir` fields for
/// local-variable references without re-parsing from scratch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    raw: String,
    parts: Vec<Part>,
}

impl Template {
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Names referenced via `%{...}` in this template, in order of
    /// appearance.
    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            Part::Reference(name) => Some(name.as_str()),
            Part::Literal(_) => None,
        })
    }

    /// Parse `raw` for scope `scope` (used only for error context). Fails
    /// eagerly on an invalid escape, an unterminated `%{`, a malformed
    /// variable name, or unescaped `${...}`.
    pub fn parse(raw: &str, scope: &Scope) -> Result<Template> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let chars: Vec<char> = raw.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            match c {
                '\\' => {
                    let next = chars.get(i + 1).copied();
                    match next {
                        Some('%') => {
                            literal.push('%');
                            i += 2;
                        }
                        Some('\\') => {
                            literal.push('\\');
                            i += 2;
                        }
                        Some(other) => {
                            return Err(Error::InvalidEscape { ch: other, scope: scope.clone() });
                        }
                        None => {
                            return Err(Error::InvalidEscape { ch: '\\', scope: scope.clone() });
                        }
                    }
                }
                '%' if chars.get(i + 1) == Some(&'{') => {
                    let (name, consumed) = read_braced(&chars, i + 2)?;
                    validate_reference_name(&name, scope)?;
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(Part::Reference(name));
                    i = consumed;
                }
                '$' if chars.get(i + 1) == Some(&'{') => {
                    let (name, _) = read_braced(&chars, i + 2)?;
                    let lower = name.to_lowercase();
                    return Err(Error::DeprecatedSyntax { name, lower, scope: scope.clone() });
                }
                other => {
                    literal.push(other);
                    i += 1;
                }
            }
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        Ok(Template { raw: raw.to_string(), parts })
    }

    /// Expand this template against an already-resolved variable map.
    /// Fails with `UndefinedVariable` for any reference not present.
    pub fn expand(&self, vars: &IndexMap<String, String>, scope: &Scope) -> Result<String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(s) => out.push_str(s),
                Part::Reference(name) => match vars.get(name) {
                    Some(v) => out.push_str(v),
                    None => {
                        return Err(Error::UndefinedVariable {
                            name: name.clone(),
                            scope: scope.clone(),
                        })
                    }
                },
            }
        }
        Ok(out)
    }
}

fn read_braced(chars: &[char], start: usize) -> Result<(String, usize)> {
    let mut j = start;
    let mut name = String::new();
    while j < chars.len() && chars[j] != '}' {
        name.push(chars[j]);
        j += 1;
    }
    if j >= chars.len() {
        return Err(Error::InvalidVariableName {
            name,
            scope: Scope::Global,
        });
    }
    Ok((name, j + 1))
}

fn validate_reference_name(name: &str, scope: &Scope) -> Result<()> {
    use crate::expand::scope::VarScope;
    match VarScope::classify(name) {
        Some(_) => Ok(()),
        None => Err(Error::InvalidVariableName {
            name: name.to_string(),
            scope: scope.clone(),
        }),
    }
}
