//! Override expressions
use super::{ComposeError, Value};
use std::fmt;
use std::str::FromStr;

/// How an override treats the field it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverrideMode {
    /// `key=value`: select a group member or replace an existing field.
    Assign,
    /// `+key=value`: add a field that must not exist yet.
    Add,
    /// `++key=value`: add the field or replace it if present.
    ForceAdd,
    /// `~key`: remove an existing field.
    Delete,
}

/// A parsed override expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    pub mode: OverrideMode,
    /// Dotted path (or group name) on the left-hand side.
    pub path: String,
    /// Parsed right-hand side. `None` only for a bare deletion.
    pub value: Option<Value>,
    /// The right-hand side text as written.
    pub raw_value: Option<String>,
}

impl Override {
    /// Parse an override expression.
    pub fn parse(expr: &str) -> Result<Self, ComposeError> {
        let invalid = |reason: &str| ComposeError::InvalidOverride {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = expr.trim();
        let (mode, rest) = if let Some(rest) = trimmed.strip_prefix("++") {
            (OverrideMode::ForceAdd, rest)
        } else if let Some(rest) = trimmed.strip_prefix('+') {
            (OverrideMode::Add, rest)
        } else if let Some(rest) = trimmed.strip_prefix('~') {
            (OverrideMode::Delete, rest)
        } else {
            (OverrideMode::Assign, trimmed)
        };

        let (path, raw_value) = match rest.split_once('=') {
            Some((path, raw)) => (path.trim(), Some(raw.trim())),
            None if mode == OverrideMode::Delete => (rest.trim(), None),
            None => return Err(invalid("expected `key=value`")),
        };
        if path.is_empty() {
            return Err(invalid("empty key"));
        }
        if path.split('.').any(str::is_empty) {
            return Err(invalid("empty path segment"));
        }
        if !path
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '@'))
        {
            return Err(invalid("key contains invalid characters"));
        }

        let value = raw_value
            .map(|raw| parse_value(raw).map_err(|err| invalid(&err.to_string())))
            .transpose()?;
        Ok(Self {
            mode,
            path: path.to_string(),
            value,
            raw_value: raw_value.map(str::to_string),
        })
    }

    /// Whether the left-hand side is a single top-level key (a possible group name).
    pub fn is_top_level(&self) -> bool {
        !self.path.contains('.')
    }
}

impl FromStr for Override {
    type Err = ComposeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Override {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let prefix = match self.mode {
            OverrideMode::Assign => "",
            OverrideMode::Add => "+",
            OverrideMode::ForceAdd => "++",
            OverrideMode::Delete => "~",
        };
        write!(f, "{}{}", prefix, self.path)?;
        if let Some(raw) = &self.raw_value {
            write!(f, "={}", raw)?;
        }
        Ok(())
    }
}

/// Parse the right-hand side of an override as a YAML flow value.
///
/// An empty right-hand side is the empty string.
fn parse_value(raw: &str) -> Result<Value, serde_yaml::Error> {
    if raw.is_empty() {
        return Ok(Value::Str(String::new()));
    }
    Value::from_yaml(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("collector=sync_single", OverrideMode::Assign, "collector", Some(Value::from("sync_single")))]
    #[case("num_workers=0", OverrideMode::Assign, "num_workers", Some(Value::Int(0)))]
    #[case("replay_buffer.size=10", OverrideMode::Assign, "replay_buffer.size", Some(Value::Int(10)))]
    #[case("++env.env.from_pixels=True", OverrideMode::ForceAdd, "env.env.from_pixels", Some(Value::Bool(true)))]
    #[case("+extra=1.5", OverrideMode::Add, "extra", Some(Value::Float(1.5)))]
    #[case("network=dqn/pixels", OverrideMode::Assign, "network", Some(Value::from("dqn/pixels")))]
    #[case("~seed", OverrideMode::Delete, "seed", None)]
    #[case("in_keys=[a, b]", OverrideMode::Assign, "in_keys", Some(Value::from(vec!["a", "b"])))]
    #[case("name=", OverrideMode::Assign, "name", Some(Value::from("")))]
    fn parse(
        #[case] expr: &str,
        #[case] mode: OverrideMode,
        #[case] path: &str,
        #[case] value: Option<Value>,
    ) {
        let parsed = Override::parse(expr).unwrap();
        assert_eq!(parsed.mode, mode);
        assert_eq!(parsed.path, path);
        assert_eq!(parsed.value, value);
    }

    #[rstest]
    #[case("no_equals")]
    #[case("=1")]
    #[case("a..b=1")]
    #[case("a b=1")]
    #[case("+")]
    fn parse_invalid(#[case] expr: &str) {
        assert!(matches!(
            Override::parse(expr),
            Err(ComposeError::InvalidOverride { .. })
        ));
    }

    #[test]
    fn display_round_trips_text() {
        let expr = "++env.env.from_pixels=true";
        assert_eq!(Override::parse(expr).unwrap().to_string(), expr);
    }
}
