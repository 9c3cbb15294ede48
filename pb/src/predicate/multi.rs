//! Multi-pair exact matching
//!
//! Resolves each configured pair against the execution variables, with
//! optional JSON-path extraction on either side, then applies the global
//! options and requires every pair to match.

use serde_json::{Map, Value, json};

use crate::domain::{ExactMultiConfig, ExpectedValueType, MatchPair};

use super::text::normalise;
use super::{Verdict, coerce_str, path};

struct PairFailure {
    record: Value,
    summary: String,
}

/// Resolve one side through JSON-path extraction. String values are parsed
/// as JSON first; structured values are used as-is.
fn extract_side(value: &Value, json_path: &str) -> Result<Value, String> {
    let parsed;
    let root = match value {
        Value::String(s) => {
            parsed = serde_json::from_str::<Value>(s).map_err(|e| format!("JSON parse failed: {e}"))?;
            &parsed
        }
        other => other,
    };
    path::extract(root, json_path)
        .cloned()
        .ok_or_else(|| format!("no value at path {json_path}"))
}

fn resolve_expected(pair: &MatchPair, index: usize, variables: &Map<String, Value>) -> Result<(Value, String), PairFailure> {
    match pair.expected_value_type {
        ExpectedValueType::FixedValue => {
            let fixed = pair.fixed_expected_value.clone();
            let usable = match &fixed {
                None | Some(Value::Null) => false,
                Some(Value::String(s)) => !s.is_empty(),
                Some(_) => true,
            };
            if !usable {
                return Err(PairFailure {
                    record: json!({"pair_index": index, "passed": false, "error": "fixed expected value not configured"}),
                    summary: format!("pair {}: fixed expected value not configured", index + 1),
                });
            }
            let value = fixed.expect("checked above");
            let source = format!("fixed value: {}", coerce_str(&value));
            Ok((value, source))
        }
        ExpectedValueType::Column => {
            let Some(column) = pair.expected_column.as_deref().filter(|c| !c.is_empty()) else {
                return Err(PairFailure {
                    record: json!({"pair_index": index, "passed": false, "error": "expected column not configured"}),
                    summary: format!("pair {}: expected column not configured", index + 1),
                });
            };
            let value = variables.get(column).cloned().unwrap_or(Value::String(String::new()));
            Ok((value, format!("column: {column}")))
        }
    }
}

/// Evaluate every configured pair; pass iff all pairs pass.
pub fn exact_multi(config: &ExactMultiConfig, variables: &Map<String, Value>) -> Verdict {
    if config.match_pairs.is_empty() {
        return Verdict::error("no match pairs configured");
    }

    let ignore_case = config.has_option("ignore_case");
    let ignore_whitespace = config.has_option("ignore_whitespace");
    let none_as_empty = config.has_option("none_as_empty");

    let mut match_results: Vec<Value> = Vec::new();
    let mut failed_pairs: Vec<String> = Vec::new();
    let mut all_passed = true;

    for (index, pair) in config.match_pairs.iter().enumerate() {
        let Some(input_column) = pair.input_column.as_deref().filter(|c| !c.is_empty()) else {
            match_results.push(json!({"pair_index": index, "passed": false, "error": "input column not configured"}));
            failed_pairs.push(format!("pair {}: input column not configured", index + 1));
            all_passed = false;
            continue;
        };

        let mut input_value = variables
            .get(input_column)
            .cloned()
            .unwrap_or(Value::String(String::new()));

        let (mut expected_value, expected_source) = match resolve_expected(pair, index, variables) {
            Ok(resolved) => resolved,
            Err(failure) => {
                match_results.push(failure.record);
                failed_pairs.push(failure.summary);
                all_passed = false;
                continue;
            }
        };

        // Optional JSON-path extraction on the input side.
        if pair.enable_input_json_extraction {
            if let Some(json_path) = pair.input_json_path.as_deref().filter(|p| !p.is_empty()) {
                match extract_side(&input_value, json_path) {
                    Ok(extracted) => input_value = extracted,
                    Err(error) => {
                        match_results.push(json!({
                            "pair_index": index,
                            "passed": false,
                            "error": format!("input value extraction failed: {error}"),
                            "input_json_path": json_path,
                        }));
                        failed_pairs.push(format!("pair {}: input value extraction failed", index + 1));
                        all_passed = false;
                        continue;
                    }
                }
            }
        }

        // Expected-side extraction only applies to column-sourced values.
        if pair.expected_value_type == ExpectedValueType::Column && pair.enable_expected_json_extraction {
            if let Some(json_path) = pair.expected_json_path.as_deref().filter(|p| !p.is_empty()) {
                match extract_side(&expected_value, json_path) {
                    Ok(extracted) => expected_value = extracted,
                    Err(error) => {
                        match_results.push(json!({
                            "pair_index": index,
                            "passed": false,
                            "error": format!("expected value extraction failed: {error}"),
                            "expected_json_path": json_path,
                        }));
                        failed_pairs.push(format!("pair {}: expected value extraction failed", index + 1));
                        all_passed = false;
                        continue;
                    }
                }
            }
        }

        if none_as_empty {
            if input_value.is_null() {
                input_value = Value::String(String::new());
            }
            if expected_value.is_null() {
                expected_value = Value::String(String::new());
            }
        }

        let input_processed = normalise(&coerce_str(&input_value), ignore_case, ignore_whitespace);
        let expected_processed = normalise(&coerce_str(&expected_value), ignore_case, ignore_whitespace);
        let pair_passed = input_processed == expected_processed;

        let mut record = json!({
            "pair_index": index,
            "input_column": input_column,
            "expected_value_type": match pair.expected_value_type {
                ExpectedValueType::Column => "column",
                ExpectedValueType::FixedValue => "fixed_value",
            },
            "expected_source": expected_source,
            "input_value": coerce_str(&input_value),
            "expected_value": coerce_str(&expected_value),
            "input_processed": input_processed,
            "expected_processed": expected_processed,
            "passed": pair_passed,
        });
        if pair.expected_value_type == ExpectedValueType::Column {
            record["expected_column"] = json!(pair.expected_column);
        }

        let mut extraction = Map::new();
        if pair.enable_input_json_extraction {
            extraction.insert("input_enabled".to_string(), json!(true));
            extraction.insert("input_json_path".to_string(), json!(pair.input_json_path));
        }
        if pair.expected_value_type == ExpectedValueType::Column && pair.enable_expected_json_extraction {
            extraction.insert("expected_enabled".to_string(), json!(true));
            extraction.insert("expected_json_path".to_string(), json!(pair.expected_json_path));
        }
        if !extraction.is_empty() {
            record["json_extraction"] = Value::Object(extraction);
        }

        if !pair_passed {
            all_passed = false;
            failed_pairs.push(format!(
                "pair {}: expected '{expected_processed}' ({expected_source}), got '{input_processed}' (column: {input_column})",
                index + 1,
            ));
        }
        match_results.push(record);
    }

    let passed_count = match_results
        .iter()
        .filter(|r| r.get("passed").and_then(Value::as_bool).unwrap_or(false))
        .count();

    Verdict::new(
        all_passed,
        json!({
            "total_pairs": config.match_pairs.len(),
            "passed_pairs": passed_count,
            "failed_pairs": failed_pairs,
            "match_results": match_results,
            "config": {
                "ignore_case": ignore_case,
                "ignore_whitespace": ignore_whitespace,
                "options": config.options,
            }
        }),
    )
}
