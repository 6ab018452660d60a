//! Variable scope determination: a name's leading character decides where
//! it may be defined and referenced.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarScope {
    /// `[A-Z][A-Za-z0-9_]*` — defined only at global scope, referenced anywhere.
    Global,
    /// `[a-z_][A-Za-z0-9_]*` — defined only in group/command scope, may not
    /// reach `cmd`/`args`/`env_vars`/`workdir` by direct template reference.
    Local,
    /// `__*` — produced only by the engine (the automatic variables).
    Reserved,
}

fn is_name_char(c: char) -> bool {
    c == '_' || c.is_ascii_alphanumeric()
}

impl VarScope {
    /// Classify a name, or `None` if it doesn't match any of the three
    /// grammars (`[A-Za-z_][A-Za-z0-9_]*` with scope-specific first char, or
    /// the reserved `__` prefix).
    pub fn classify(name: &str) -> Option<VarScope> {
        if name.is_empty() {
            return None;
        }
        if name.starts_with("__") {
            return Some(VarScope::Reserved);
        }
        let first = name.chars().next().unwrap();
        if !name.chars().all(is_name_char) {
            return None;
        }
        if first.is_ascii_uppercase() {
            Some(VarScope::Global)
        } else if first.is_ascii_lowercase() || first == '_' {
            Some(VarScope::Local)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_global_names() {
        assert_eq!(VarScope::classify("HOME"), Some(VarScope::Global));
        assert_eq!(VarScope::classify("Path_2"), Some(VarScope::Global));
    }

    #[test]
    fn classifies_local_names() {
        assert_eq!(VarScope::classify("app_dir"), Some(VarScope::Local));
        assert_eq!(VarScope::classify("_hidden"), Some(VarScope::Local));
    }

    #[test]
    fn classifies_reserved_names() {
        assert_eq!(VarScope::classify("__runner_pid"), Some(VarScope::Reserved));
    }

    #[test]
    fn rejects_invalid_names() {
        assert_eq!(VarScope::classify(""), None);
        assert_eq!(VarScope::classify("1abc"), None);
        assert_eq!(VarScope::classify("bad-name"), None);
        assert_eq!(VarScope::classify("bad name"), None);
    }
}
