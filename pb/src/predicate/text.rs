//! Text matching strategies: exact, contains, keywords, regex

use regex::RegexBuilder;
use serde_json::json;
use std::sync::LazyLock;

use crate::domain::{ContainsConfig, ExactConfig, KeywordsConfig, RegexConfig};

use super::Verdict;

static WHITESPACE: LazyLock<regex::Regex> = LazyLock::new(|| regex::Regex::new(r"\s+").expect("static regex"));

pub(crate) fn normalise(text: &str, ignore_case: bool, ignore_whitespace: bool) -> String {
    let mut cleaned = text.trim().to_string();
    if ignore_case {
        cleaned = cleaned.to_lowercase();
    }
    if ignore_whitespace {
        cleaned = WHITESPACE.replace_all(&cleaned, " ").into_owned();
    }
    cleaned
}

/// Strict equality after the configured normalisation.
pub fn exact(output: &str, expected: &str, config: &ExactConfig) -> Verdict {
    let output_clean = normalise(output, config.ignore_case, config.ignore_whitespace);
    let expected_clean = normalise(expected, config.ignore_case, config.ignore_whitespace);

    Verdict::new(
        output_clean == expected_clean,
        json!({
            "config": {
                "ignore_case": config.ignore_case,
                "ignore_whitespace": config.ignore_whitespace,
            }
        }),
    )
}

/// Substring test.
pub fn contains(output: &str, expected: &str, config: &ContainsConfig) -> Verdict {
    let output_clean = normalise(output, config.ignore_case, false);
    let expected_clean = normalise(expected, config.ignore_case, false);

    Verdict::new(
        output_clean.contains(&expected_clean),
        json!({"config": {"ignore_case": config.ignore_case}}),
    )
}

/// Count keyword occurrences; pass when at least `required_count` hit.
/// Falls back to splitting the expected value on commas when the config
/// carries no keyword list.
pub fn keywords(output: &str, expected: &str, config: &KeywordsConfig) -> Verdict {
    let mut keywords = config.keywords.clone();
    if keywords.is_empty() && !expected.trim().is_empty() {
        keywords = expected.trim().split(',').map(|k| k.to_string()).collect();
    }

    let output_check = if config.ignore_case {
        output.to_lowercase()
    } else {
        output.to_string()
    };

    let mut matched = Vec::new();
    for keyword in &keywords {
        let needle = if config.ignore_case {
            keyword.trim().to_lowercase()
        } else {
            keyword.trim().to_string()
        };
        if output_check.contains(&needle) {
            matched.push(keyword.trim().to_string());
        }
    }

    let required = config.required_count.unwrap_or(keywords.len());
    Verdict::new(
        matched.len() >= required,
        json!({
            "keywords": keywords,
            "matched_keywords": matched,
            "required_count": required,
            "config": {"ignore_case": config.ignore_case},
        }),
    )
}

/// Pass when the pattern matches anywhere in the output. The pattern falls
/// back to the expected value when the config leaves it unset.
pub fn regex_match(output: &str, expected: &str, config: &RegexConfig) -> Verdict {
    let pattern = config
        .pattern
        .clone()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| expected.to_string());
    if pattern.is_empty() {
        return Verdict::error("no regex pattern provided");
    }

    let compiled = RegexBuilder::new(&pattern)
        .case_insensitive(config.ignore_case)
        .multi_line(config.multiline)
        .dot_matches_new_line(config.dotall)
        .build();

    let regex = match compiled {
        Ok(regex) => regex,
        Err(e) => {
            return Verdict::fail(json!({"error": format!("invalid regex: {e}"), "pattern": pattern}));
        }
    };

    let matches: Vec<String> = regex.find_iter(output).map(|m| m.as_str().to_string()).collect();
    Verdict::new(
        !matches.is_empty(),
        json!({
            "pattern": pattern,
            "matches": matches,
            "match_count": matches.len(),
            "config": {
                "ignore_case": config.ignore_case,
                "multiline": config.multiline,
                "dotall": config.dotall,
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_basic() {
        let config = ExactConfig::default();
        assert!(exact("hi", "hi", &config).passed);
        assert!(exact("  hi  ", "hi", &config).passed);
        assert!(!exact("hi", "Hi", &config).passed);
    }

    #[test]
    fn test_exact_options() {
        let config = ExactConfig {
            ignore_case: true,
            ignore_whitespace: true,
            ..Default::default()
        };
        assert!(exact("Hello   World", "hello world", &config).passed);
        assert!(exact("A\tB\n C", "a b c", &config).passed);
        assert!(!exact("ab", "a b", &config).passed);
    }

    #[test]
    fn test_contains() {
        let config = ContainsConfig::default();
        assert!(contains("the quick brown fox", "quick", &config).passed);
        assert!(!contains("the quick brown fox", "Quick", &config).passed);

        let config = ContainsConfig {
            ignore_case: true,
            ..Default::default()
        };
        assert!(contains("the quick brown fox", "QUICK", &config).passed);
    }

    #[test]
    fn test_keywords_all_required_by_default() {
        let config = KeywordsConfig {
            keywords: vec!["alpha".to_string(), "beta".to_string()],
            ..Default::default()
        };
        assert!(keywords("alpha and beta", "", &config).passed);
        assert!(!keywords("alpha only", "", &config).passed);
    }

    #[test]
    fn test_keywords_required_count_and_fallback() {
        let config = KeywordsConfig {
            required_count: Some(1),
            ignore_case: true,
            ..Default::default()
        };
        // Keywords come from the expected value when the config has none.
        let verdict = keywords("ALPHA only", "alpha, beta", &config);
        assert!(verdict.passed);
        assert_eq!(verdict.detail("matched_keywords").unwrap(), &serde_json::json!(["alpha"]));
    }

    #[test]
    fn test_regex_pattern_from_config_and_expected() {
        let config = RegexConfig {
            pattern: Some(r"\d{3}".to_string()),
            ..Default::default()
        };
        let verdict = regex_match("code 123 end", "", &config);
        assert!(verdict.passed);
        assert_eq!(verdict.detail("match_count").unwrap(), &serde_json::json!(1));

        // Falls back to the expected value as pattern.
        let verdict = regex_match("abc", "a.c", &RegexConfig::default());
        assert!(verdict.passed);
    }

    #[test]
    fn test_regex_flags() {
        let config = RegexConfig {
            pattern: Some("^line2$".to_string()),
            multiline: true,
            ..Default::default()
        };
        assert!(regex_match("line1\nline2", "", &config).passed);

        let config = RegexConfig {
            pattern: Some("a.b".to_string()),
            dotall: true,
            ..Default::default()
        };
        assert!(regex_match("a\nb", "", &config).passed);
    }

    #[test]
    fn test_regex_errors() {
        assert!(!regex_match("anything", "", &RegexConfig::default()).passed);

        let config = RegexConfig {
            pattern: Some("(unclosed".to_string()),
            ..Default::default()
        };
        let verdict = regex_match("anything", "", &config);
        assert!(!verdict.passed);
        assert!(verdict.detail("error").is_some());
    }
}
