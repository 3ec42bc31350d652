//! Operator configuration.
//!
//! All knobs live in one struct passed by reference into the reconciler
//! and follower at construction time; there is no global mutable state.

use std::collections::BTreeMap;

/// Configuration for the operator.
#[derive(Debug, Clone, Default)]
pub struct OperatorConfig {
    /// AWS region to operate in. `None` defers to the ambient AWS config.
    pub region: Option<String>,
    /// Role ARN to assume for stacks in another account.
    pub assume_role: Option<String>,
    /// Tags applied to every stack, after the operator-managed ones.
    pub default_tags: BTreeMap<String, String>,
    /// Capabilities acknowledged on every create and update call.
    pub default_capabilities: Vec<String>,
    /// When set, mutating provider calls are logged but not issued.
    pub dry_run: bool,
    /// Namespace to watch. `None` or empty watches all namespaces.
    pub namespace: Option<String>,
}

/// Parse a `KEY=VALUE` flag argument into a tag pair.
///
/// # Errors
///
/// Returns a message when the argument has no `=` or an empty key.
pub fn parse_key_value(arg: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{arg}`"))?;
    if key.is_empty() {
        return Err(format!("expected a non-empty key in `{arg}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_pairs() {
        assert_eq!(
            parse_key_value("team=platform").unwrap(),
            ("team".to_string(), "platform".to_string())
        );
        // Values may contain '='.
        assert_eq!(
            parse_key_value("expr=a=b").unwrap(),
            ("expr".to_string(), "a=b".to_string())
        );
        // Empty values are allowed.
        assert_eq!(
            parse_key_value("empty=").unwrap(),
            ("empty".to_string(), String::new())
        );
    }

    #[test]
    fn rejects_malformed_pairs() {
        assert!(parse_key_value("no-separator").is_err());
        assert!(parse_key_value("=value").is_err());
    }
}
