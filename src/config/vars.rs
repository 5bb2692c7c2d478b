//! `${VAR}` interpolation for YAML config files.
//!
//! Supported forms:
//! - `$VAR` / `${VAR}`: required, an error if unset
//! - `${VAR:-fallback}`: fallback when unset or empty
//! - `${VAR-fallback}`: fallback only when unset
//! - `$$`: a literal `$`

use regex::{Captures, Regex};
use std::sync::LazyLock;

static VAR_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$
        |
        \$\{ ([A-Za-z_][A-Za-z0-9_]*) (?: (:?-) ([^}]*) )? \}
        |
        \$([A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("variable reference pattern is valid")
});

/// Interpolated text plus every problem found along the way.
#[derive(Debug)]
pub struct Interpolated {
    pub text: String,
    pub errors: Vec<String>,
}

impl Interpolated {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Interpolate against the process environment.
pub fn interpolate(input: &str) -> Interpolated {
    interpolate_with(input, |name| std::env::var(name).ok())
}

/// Interpolate against an arbitrary variable source.
///
/// Errors are accumulated rather than returned on the first miss, so a
/// misconfigured deployment sees every missing variable at once.
pub fn interpolate_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> Interpolated {
    let mut errors = Vec::new();

    let text = VAR_REFERENCE
        .replace_all(input, |caps: &Captures| {
            let whole = &caps[0];
            if whole == "$$" {
                return "$".to_string();
            }

            let Some(name) = caps.get(1).or_else(|| caps.get(4)).map(|m| m.as_str()) else {
                return whole.to_string();
            };
            let empty_counts_as_unset = caps.get(2).is_some_and(|m| m.as_str() == ":-");
            let fallback = caps.get(3).map(|m| m.as_str());

            match lookup(name) {
                Some(value) if value.contains(['\n', '\r']) => {
                    errors.push(format!("{name} contains a line break"));
                    whole.to_string()
                }
                Some(value) if value.is_empty() && empty_counts_as_unset => {
                    fallback.unwrap_or_default().to_string()
                }
                Some(value) => value,
                None => match fallback {
                    Some(fallback) => fallback.to_string(),
                    None => {
                        errors.push(format!("{name} is not set"));
                        whole.to_string()
                    }
                },
            }
        })
        .into_owned();

    Interpolated { text, errors }
}
