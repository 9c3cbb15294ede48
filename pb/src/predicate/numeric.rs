//! Numeric strategies: distance and counting

use regex::Regex;
use serde_json::json;
use std::sync::LazyLock;

use crate::domain::{CountConfig, CountType, NumericDistanceConfig};

use super::Verdict;

static NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-?\d+\.?\d*").expect("static regex"));

/// First numeric token in the text, or the whole text if it parses.
pub fn extract_number(text: &str) -> Option<f64> {
    if text.is_empty() {
        return None;
    }
    if let Ok(number) = text.trim().parse::<f64>() {
        return Some(number);
    }
    NUMBER.find(text).and_then(|m| m.as_str().parse().ok())
}

/// Pass when `|output - expected| <= threshold`, or within the percentage
/// tolerance when configured (and the expected value is non-zero).
pub fn numeric_distance(output: &str, expected: &str, config: &NumericDistanceConfig) -> Verdict {
    let (Some(output_value), Some(expected_value)) = (extract_number(output), extract_number(expected)) else {
        return Verdict::error("could not extract a number from output or expected value");
    };

    let distance = (output_value - expected_value).abs();

    if config.percentage_threshold && expected_value != 0.0 {
        let percentage_diff = (distance / expected_value.abs()) * 100.0;
        return Verdict::new(
            percentage_diff <= config.percentage_value,
            json!({
                "output_value": output_value,
                "expected_value": expected_value,
                "distance": distance,
                "percentage_diff": percentage_diff,
                "percentage_threshold": config.percentage_value,
                "config": {"percentage_threshold": true, "percentage_value": config.percentage_value},
            }),
        );
    }

    Verdict::new(
        distance <= config.threshold,
        json!({
            "output_value": output_value,
            "expected_value": expected_value,
            "distance": distance,
            "threshold": config.threshold,
        }),
    )
}

/// Count characters, words, or paragraphs (non-empty blocks split on
/// blank lines); compare against the expected count when one is given.
pub fn count(output: &str, expected: &str, config: &CountConfig) -> Verdict {
    let type_name = format!("{:?}", config.count_type).to_lowercase();

    if output.is_empty() {
        return Verdict::pass(json!({"count": 0, "count_type": type_name}));
    }

    let counted = match config.count_type {
        CountType::Characters => output.chars().count(),
        CountType::Words => output.split_whitespace().count(),
        CountType::Paragraphs => output.split("\n\n").filter(|p| !p.trim().is_empty()).count(),
    };

    if expected.is_empty() {
        return Verdict::pass(json!({"count": counted, "count_type": type_name}));
    }

    match expected.trim().parse::<usize>() {
        Ok(expected_count) => Verdict::new(
            counted == expected_count,
            json!({"count": counted, "count_type": type_name, "expected_count": expected_count}),
        ),
        Err(_) => Verdict::fail(json!({
            "count": counted,
            "count_type": type_name,
            "error": "expected value is not a valid number",
        })),
    }
}
