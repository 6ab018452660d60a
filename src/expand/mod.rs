//! C3: variable scopes, `%{...}` templates, and the two-phase expansion
//! engine that turns raw manifest strings into `expanded_vars`/`expanded_env`.

pub mod engine;
pub mod scope;
pub mod template;

pub use engine::{
    automatic_vars, effective_env_allowed, expand_scope, validate_template_local_references,
    ExpandedScope, ScopeInputs,
};
pub use scope::VarScope;
pub use template::Template;
