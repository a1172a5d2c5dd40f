//! Environment variable expansion for configuration text.
//!
//! Recognized forms:
//! - `$VAR` and `${VAR}` expand to the variable, missing is an error
//! - `${VAR:-fallback}` uses the fallback when VAR is unset or empty
//! - `${VAR-fallback}` uses the fallback only when VAR is unset
//! - `$$` produces a literal `$`

use std::sync::LazyLock;

use regex::{Captures, Regex};

static VAR_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        (?P<escape>\$\$)
        |
        \$\{
            (?P<braced>[A-Za-z_][A-Za-z0-9_]*)
            (?: (?P<op>:?-) (?P<fallback>[^}]*) )?
        \}
        |
        \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("variable reference pattern is valid")
});

/// Expanded text plus every problem found while expanding it.
#[derive(Debug)]
pub struct InterpolationResult {
    pub text: String,
    pub errors: Vec<String>,
}

impl InterpolationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Expand references against the process environment.
pub fn interpolate(input: &str) -> InterpolationResult {
    interpolate_with(input, |name| std::env::var(name).ok())
}

/// Expand references using `lookup` to resolve variable names.
pub fn interpolate_with<F>(input: &str, lookup: F) -> InterpolationResult
where
    F: Fn(&str) -> Option<String>,
{
    let mut errors = Vec::new();

    let text = VAR_REFERENCE
        .replace_all(input, |caps: &Captures| {
            let whole = &caps[0];
            if caps.name("escape").is_some() {
                return "$".to_string();
            }

            let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
                return whole.to_string();
            };
            let name = name.as_str();
            let op = caps.name("op").map(|m| m.as_str());
            let fallback = caps.name("fallback").map(|m| m.as_str());

            match (lookup(name), fallback) {
                (Some(value), _) if value.contains(['\n', '\r']) => {
                    errors.push(format!("variable '{name}' contains a line break"));
                    whole.to_string()
                }
                (Some(value), Some(fallback)) if value.is_empty() && op == Some(":-") => {
                    fallback.to_string()
                }
                (Some(value), _) => value,
                (None, Some(fallback)) => fallback.to_string(),
                (None, None) => {
                    errors.push(format!("variable '{name}' is not set"));
                    whole.to_string()
                }
            }
        })
        .into_owned();

    InterpolationResult { text, errors }
}
