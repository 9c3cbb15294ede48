//! JSON-oriented strategies: structure check, extraction, value parsing,
//! type validation

use regex::RegexBuilder;
use serde_json::{Value, json};
use std::sync::LazyLock;

use crate::domain::{JsonExtractionConfig, JsonStructureConfig, ParseValueConfig, TargetType, TypeValidationConfig,
                    ValidationType};

use super::{Verdict, coerce_str, path};

/// Required fields (explicit list, or expected's top-level keys) must all
/// appear in the output object.
pub fn json_structure(output: &str, expected: &str, config: &JsonStructureConfig) -> Verdict {
    let output_json: Value = match serde_json::from_str(output) {
        Ok(value) => value,
        Err(e) => return Verdict::error(format!("output is not valid JSON: {e}")),
    };

    let expected_json: Value = if expected.is_empty() {
        json!({})
    } else {
        match serde_json::from_str(expected) {
            Ok(value) => value,
            Err(e) => return Verdict::error(format!("expected output is not valid JSON: {e}")),
        }
    };

    let required: Vec<String> = match &config.required_fields {
        Some(fields) => fields.clone(),
        None => expected_json
            .as_object()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default(),
    };

    let missing: Vec<&String> = required
        .iter()
        .filter(|field| output_json.get(field.as_str()).is_none())
        .collect();

    Verdict::new(
        missing.is_empty(),
        json!({"required_fields": required, "missing_fields": missing}),
    )
}

/// Extract at `json_path`; when an expected value is present, compare with
/// type-aware parsing, otherwise pass on successful extraction.
pub fn json_extraction(output: &str, expected: &str, config: &JsonExtractionConfig) -> Verdict {
    if output.is_empty() {
        return Verdict::error("output is empty");
    }
    let output_json: Value = match serde_json::from_str(output) {
        Ok(value) => value,
        Err(e) => return Verdict::error(format!("output is not valid JSON: {e}")),
    };

    let Some(extracted) = path::extract(&output_json, &config.json_path) else {
        return Verdict::fail(json!({
            "json_path": config.json_path,
            "error": "no value at the given path",
        }));
    };

    let passed = if expected.is_empty() {
        true
    } else {
        match serde_json::from_str::<Value>(expected) {
            Ok(expected_json) => *extracted == expected_json,
            Err(_) => coerce_str(extracted) == expected,
        }
    };

    Verdict::new(
        passed,
        json!({"json_path": config.json_path, "extracted_value": extracted}),
    )
}

fn parse_as(target: TargetType, text: &str) -> Result<Value, String> {
    match target {
        TargetType::Number => {
            let number: f64 = text.trim().parse().map_err(|e| format!("{e}"))?;
            if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
                Ok(json!(number as i64))
            } else {
                Ok(json!(number))
            }
        }
        TargetType::Boolean => {
            let truthy = matches!(text.trim().to_lowercase().as_str(), "true" | "yes" | "1" | "y");
            Ok(json!(truthy))
        }
        TargetType::Json => serde_json::from_str(text).map_err(|e| format!("{e}")),
        TargetType::String => Ok(json!(text)),
    }
}

/// Pass iff the output converts to the target type; compare against the
/// expected value (parsed the same way) when one is given.
pub fn parse_value(output: &str, expected: &str, config: &ParseValueConfig) -> Verdict {
    let target_name = format!("{:?}", config.target_type).to_lowercase();

    let parsed = match parse_as(config.target_type, output) {
        Ok(value) => value,
        Err(error) => {
            return Verdict::fail(json!({
                "target_type": target_name,
                "error": format!("failed to parse as {target_name}: {error}"),
            }));
        }
    };

    if expected.is_empty() {
        return Verdict::pass(json!({"target_type": target_name, "parsed_value": parsed}));
    }

    match parse_as(config.target_type, expected) {
        Ok(expected_value) => Verdict::new(
            parsed == expected_value,
            json!({
                "target_type": target_name,
                "parsed_value": parsed,
                "expected_value": expected_value,
            }),
        ),
        Err(error) => Verdict::fail(json!({
            "target_type": target_name,
            "parsed_value": parsed,
            "error": format!("failed to parse expected value: {error}"),
        })),
    }
}

static SQL_SHAPES: LazyLock<Vec<regex::Regex>> = LazyLock::new(|| {
    [
        r"SELECT\s+.+\s+FROM\s+.+",
        r"INSERT\s+INTO\s+.+\s+VALUES\s*\(.+\)",
        r"UPDATE\s+.+\s+SET\s+.+",
        r"DELETE\s+FROM\s+.+",
    ]
    .iter()
    .map(|pattern| {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()
            .expect("static regex")
    })
    .collect()
});

/// Validate the output's shape: parseable JSON, a number, or one of the
/// four SQL statement shapes.
pub fn type_validation(output: &str, config: &TypeValidationConfig) -> Verdict {
    match config.validation_type {
        ValidationType::Json => match serde_json::from_str::<Value>(output) {
            Ok(_) => Verdict::pass(json!({"validation_type": "json", "is_valid": true})),
            Err(e) => Verdict::fail(json!({"validation_type": "json", "is_valid": false, "error": format!("{e}")})),
        },
        ValidationType::Number => {
            let is_valid = output.trim().parse::<f64>().is_ok();
            Verdict::new(is_valid, json!({"validation_type": "number", "is_valid": is_valid}))
        }
        ValidationType::Sql => {
            let is_valid = SQL_SHAPES.iter().any(|shape| shape.is_match(output));
            Verdict::new(is_valid, json!({"validation_type": "sql", "is_valid": is_valid}))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_structure_from_expected_keys() {
        let config = JsonStructureConfig::default();
        let verdict = json_structure(r#"{"a": 1, "b": 2}"#, r#"{"a": 0, "b": 0}"#, &config);
        assert!(verdict.passed);

        let verdict = json_structure(r#"{"a": 1}"#, r#"{"a": 0, "b": 0}"#, &config);
        assert!(!verdict.passed);
        assert_eq!(verdict.detail("missing_fields").unwrap(), &json!(["b"]));
    }

    #[test]
    fn test_json_structure_explicit_fields() {
        let config = JsonStructureConfig {
            required_fields: Some(vec!["name".to_string()]),
            ..Default::default()
        };
        assert!(json_structure(r#"{"name": "x"}"#, "", &config).passed);
        assert!(!json_structure(r#"{"other": 1}"#, "", &config).passed);
        assert!(!json_structure("not json", "", &config).passed);
    }

    #[test]
    fn test_json_extraction_with_expected() {
        let config = JsonExtractionConfig {
            json_path: "items[0].name".to_string(),
            reference_column: None,
            expected_column: None,
        };
        let output = r#"{"items":[{"name":"ok"}]}"#;

        let verdict = json_extraction(output, "\"ok\"", &config);
        assert!(verdict.passed);
        assert_eq!(verdict.detail("extracted_value").unwrap(), &json!("ok"));

        // Plain string expected compares by coercion.
        assert!(json_extraction(output, "ok", &config).passed);
        assert!(!json_extraction(output, "nope", &config).passed);
    }

    #[test]
    fn test_json_extraction_without_expected_passes_on_hit() {
        let config = JsonExtractionConfig {
            json_path: "a.b".to_string(),
            reference_column: None,
            expected_column: None,
        };
        assert!(json_extraction(r#"{"a":{"b":5}}"#, "", &config).passed);

        let verdict = json_extraction(r#"{"a":{}}"#, "", &config);
        assert!(!verdict.passed);
        assert!(verdict.detail("error").is_some());
    }

    #[test]
    fn test_parse_value_number() {
        let config = ParseValueConfig {
            target_type: TargetType::Number,
            ..Default::default()
        };
        let verdict = parse_value("42", "", &config);
        assert!(verdict.passed);
        assert_eq!(verdict.detail("parsed_value").unwrap(), &json!(42));

        let verdict = parse_value("42.5", "42.5", &config);
        assert!(verdict.passed);

        assert!(!parse_value("not a number", "", &config).passed);
        assert!(!parse_value("42", "43", &config).passed);
    }

    #[test]
    fn test_parse_value_boolean_and_json() {
        let config = ParseValueConfig {
            target_type: TargetType::Boolean,
            ..Default::default()
        };
        let verdict = parse_value("YES", "true", &config);
        assert!(verdict.passed);

        let config = ParseValueConfig {
            target_type: TargetType::Json,
            ..Default::default()
        };
        assert!(parse_value(r#"{"a":1}"#, r#"{"a":1}"#, &config).passed);
        assert!(!parse_value(r#"{"a":1}"#, r#"{"a":2}"#, &config).passed);
        assert!(!parse_value("{broken", "", &config).passed);
    }

    #[test]
    fn test_type_validation() {
        let json_config = TypeValidationConfig {
            validation_type: ValidationType::Json,
            ..Default::default()
        };
        assert!(type_validation(r#"[1,2,3]"#, &json_config).passed);
        assert!(!type_validation("nope", &json_config).passed);

        let number_config = TypeValidationConfig {
            validation_type: ValidationType::Number,
            ..Default::default()
        };
        assert!(type_validation(" 3.14 ", &number_config).passed);
        assert!(!type_validation("pi", &number_config).passed);

        let sql_config = TypeValidationConfig {
            validation_type: ValidationType::Sql,
            ..Default::default()
        };
        assert!(type_validation("select id from users where age > 10", &sql_config).passed);
        assert!(type_validation("INSERT INTO t (a) VALUES (1)", &sql_config).passed);
        assert!(type_validation("UPDATE users SET name = 'x'", &sql_config).passed);
        assert!(type_validation("DELETE FROM users", &sql_config).passed);
        assert!(!type_validation("DROP TABLE users", &sql_config).passed);
    }
}
