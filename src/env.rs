//! `${VAR}` expansion for connection strings.
//!
//! `${VAR:-fallback}` uses `fallback` when `VAR` is unset or empty.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvError {
    #[error("environment variable '{0}' is not set")]
    Unset(String),
    #[error("unclosed variable reference at byte {0}")]
    Unclosed(usize),
}

/// Expand references against the process environment.
pub fn interpolate_env(template: &str) -> Result<String, EnvError> {
    expand(template, |name| std::env::var(name).ok())
}

/// Expand references, resolving each name with `lookup`.
pub fn expand(template: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String, EnvError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let body_start = start + 2;
        let Some(len) = rest[body_start..].find('}') else {
            return Err(EnvError::Unclosed(offset + start));
        };
        let body = &rest[body_start..body_start + len];
        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };
        let value = match (lookup(name), fallback) {
            (Some(value), Some(fallback)) if value.is_empty() => fallback.to_string(),
            (Some(value), _) => value,
            (None, Some(fallback)) => fallback.to_string(),
            (None, None) => return Err(EnvError::Unset(name.to_string())),
        };
        out.push_str(&value);

        let consumed = body_start + len + 1;
        offset += consumed;
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars() -> HashMap<&'static str, &'static str> {
        HashMap::from([("MONGO_HOST", "db.internal"), ("EMPTY", "")])
    }

    fn expand_with_vars(template: &str) -> Result<String, EnvError> {
        let vars = vars();
        expand(template, |name| vars.get(name).map(|v| v.to_string()))
    }

    #[test]
    fn expands_known_variables() {
        assert_eq!(
            expand_with_vars("mongodb://${MONGO_HOST}:27017").unwrap(),
            "mongodb://db.internal:27017"
        );
        assert_eq!(expand_with_vars("no vars here").unwrap(), "no vars here");
        assert_eq!(expand_with_vars("$MONGO_HOST").unwrap(), "$MONGO_HOST");
        assert_eq!(expand_with_vars("").unwrap(), "");
        assert_eq!(expand_with_vars("a${EMPTY}b").unwrap(), "ab");
    }

    #[test]
    fn fallback_covers_unset_and_empty() {
        assert_eq!(
            expand_with_vars("${MONGO_PORT:-27017}/${EMPTY:-x}").unwrap(),
            "27017/x"
        );
        assert_eq!(expand_with_vars("${MONGO_HOST:-other}").unwrap(), "db.internal");
    }

    #[test]
    fn unset_variable_is_named() {
        assert_eq!(
            interpolate_env("${NONEXISTENT_VAR_12345}"),
            Err(EnvError::Unset("NONEXISTENT_VAR_12345".to_string()))
        );
    }

    #[test]
    fn unclosed_reference_points_at_it() {
        assert_eq!(
            expand_with_vars("mongodb://${MONGO_HOST}/${db"),
            Err(EnvError::Unclosed(24))
        );
    }
}
