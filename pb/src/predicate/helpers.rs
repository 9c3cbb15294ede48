//! Value-producing helper strategies: static values and coalescing

use serde_json::{Value, json};

use crate::domain::{CoalesceConfig, StaticValueConfig};

use super::Verdict;

/// Returns the configured static value unconditionally.
pub fn static_value(config: &StaticValueConfig) -> Verdict {
    Verdict::pass(json!({"static_value": config.static_value}))
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// First non-empty of `[expected, output, ...config.values]`.
pub fn coalesce(output: &str, expected: &str, config: &CoalesceConfig) -> Verdict {
    let mut candidates: Vec<Value> = Vec::new();
    if !expected.is_empty() {
        candidates.push(Value::String(expected.to_string()));
    }
    if !output.is_empty() {
        candidates.push(Value::String(output.to_string()));
    }
    candidates.extend(config.values.iter().cloned());

    let coalesced = candidates.iter().find(|v| !is_empty(v)).cloned().unwrap_or(Value::Null);

    Verdict::pass(json!({"coalesced_value": coalesced, "values": candidates}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_value() {
        let config = StaticValueConfig {
            static_value: json!("fixed"),
        };
        let verdict = static_value(&config);
        assert!(verdict.passed);
        assert_eq!(verdict.detail("static_value").unwrap(), &json!("fixed"));
    }

    #[test]
    fn test_coalesce_order() {
        let config = CoalesceConfig {
            values: vec![json!("fallback")],
            ..Default::default()
        };
        // Expected wins over output.
        let verdict = coalesce("out", "exp", &config);
        assert_eq!(verdict.detail("coalesced_value").unwrap(), &json!("exp"));

        // Output wins over configured values.
        let verdict = coalesce("out", "", &config);
        assert_eq!(verdict.detail("coalesced_value").unwrap(), &json!("out"));

        // Configured values as a last resort.
        let verdict = coalesce("", "", &config);
        assert_eq!(verdict.detail("coalesced_value").unwrap(), &json!("fallback"));
    }

    #[test]
    fn test_coalesce_skips_empty_candidates() {
        let config = CoalesceConfig {
            values: vec![Value::Null, json!(""), json!(0)],
            ..Default::default()
        };
        let verdict = coalesce("", "", &config);
        // Zero is a value, not emptiness.
        assert_eq!(verdict.detail("coalesced_value").unwrap(), &json!(0));

        let empty = CoalesceConfig::default();
        let verdict = coalesce("", "", &empty);
        assert!(verdict.passed);
        assert_eq!(verdict.detail("coalesced_value").unwrap(), &Value::Null);
    }
}
