//! LLM-backed strategies: assertions and semantic similarity
//!
//! `llm_assertion` asks a judge model whether the output satisfies a
//! natural-language assertion; callers acquire the rate limiter first.
//! `cosine_similarity` has no embedding transport wired and uses a lexical
//! proxy, flagged in its details.

use regex::Regex;
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use std::sync::LazyLock;

use crate::domain::{CosineSimilarityConfig, LlmAssertionConfig};
use crate::llm::{ChatMessage, LlmRequest};
use crate::prompt::{FEATURE_EVALUATION_LLM, FeatureModels, PromptInvoker};

use super::Verdict;

static FENCED_OR_BRACED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```|\{.*\}").expect("static regex"));

fn assertion_prompt(output: &str, assertion: &str) -> String {
    format!(
        r#"You are an assistant that evaluates text. Decide whether the text below satisfies the given assertion.

Text:
---
{output}
---

Assertion:
{assertion}

Answer in JSON with these fields:
1. passed: true or false, whether the assertion holds
2. explanation: a short justification

Example:
{{
  "passed": true,
  "explanation": "The text satisfies the assertion because..."
}}"#
    )
}

/// Pull the JSON object out of a judge response, tolerating fenced code
/// blocks and surrounding prose.
fn parse_judgement(response: &str) -> Option<Value> {
    let candidate = FENCED_OR_BRACED.captures(response).map(|captures| {
        captures
            .get(1)
            .map(|fenced| fenced.as_str().to_string())
            .unwrap_or_else(|| captures.get(0).expect("whole match").as_str().to_string())
    })?;
    serde_json::from_str(&candidate).ok()
}

/// Ask the judge model whether the assertion holds for the output.
pub async fn llm_assertion(
    output: &str,
    config: &LlmAssertionConfig,
    invoker: &PromptInvoker,
    features: &dyn FeatureModels,
) -> Verdict {
    if config.assertion.is_empty() {
        return Verdict::error("no assertion provided");
    }

    let (default_provider, default_model) = features.resolve(config.project_id, FEATURE_EVALUATION_LLM).await;
    let provider = config.provider.clone().unwrap_or(default_provider);
    let model = config.model.clone().unwrap_or(default_model);

    let prompt = assertion_prompt(output, &config.assertion);
    let request = LlmRequest::new(provider, model, vec![ChatMessage::user(prompt)]);

    let response = match invoker
        .call_llm(
            "llm_assertion",
            config.project_id,
            config.user_id.unwrap_or(0),
            None,
            None,
            Map::new(),
            request,
        )
        .await
    {
        Ok(response) => response,
        Err(e) => {
            return Verdict::fail(json!({
                "assertion": config.assertion,
                "error": format!("LLM evaluation failed: {e}"),
            }));
        }
    };

    let text = response.text;
    match parse_judgement(&text) {
        Some(judgement) => {
            let passed = judgement.get("passed").and_then(Value::as_bool).unwrap_or(false);
            let explanation = judgement
                .get("explanation")
                .and_then(Value::as_str)
                .unwrap_or("no explanation provided")
                .to_string();
            Verdict::new(
                passed,
                json!({
                    "assertion": config.assertion,
                    "llm_response": text,
                    "explanation": explanation,
                }),
            )
        }
        None => {
            // Keyword heuristic when the judge ignored the JSON contract.
            let lowered = text.to_lowercase();
            let passed = lowered.contains("true") && !lowered.contains("false");
            Verdict::new(
                passed,
                json!({
                    "assertion": config.assertion,
                    "llm_response": text,
                    "error": "could not parse LLM response as JSON",
                    "fallback_evaluation": "keyword heuristic",
                }),
            )
        }
    }
}

fn word_set(text: &str) -> BTreeSet<String> {
    text.to_lowercase().split_whitespace().map(|w| w.to_string()).collect()
}

/// Lexical similarity proxy: Jaccard index over word sets. Flagged with a
/// warning because no embedding transport is wired.
pub fn cosine_similarity(output: &str, expected: &str, config: &CosineSimilarityConfig) -> Verdict {
    if output.is_empty() || expected.is_empty() {
        return Verdict::error("output or expected output is empty");
    }

    let output_words = word_set(output);
    let expected_words = word_set(expected);
    let intersection = output_words.intersection(&expected_words).count();
    let union = output_words.union(&expected_words).count();
    let similarity = if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    };

    Verdict::new(
        similarity >= config.threshold,
        json!({
            "similarity": similarity,
            "threshold": config.threshold,
            "embedding_model": config.embedding_model.clone().unwrap_or_else(|| "lexical-jaccard".to_string()),
            "warning": "similarity computed with a lexical proxy, not embeddings",
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_judgement_variants() {
        let fenced = "Here you go:\n```json\n{\"passed\": true, \"explanation\": \"ok\"}\n```";
        assert_eq!(parse_judgement(fenced).unwrap()["passed"], json!(true));

        let bare = "{\"passed\": false, \"explanation\": \"nope\"}";
        assert_eq!(parse_judgement(bare).unwrap()["passed"], json!(false));

        let embedded = "I think {\"passed\": true, \"explanation\": \"sure\"} covers it";
        assert_eq!(parse_judgement(embedded).unwrap()["passed"], json!(true));

        assert!(parse_judgement("no json here").is_none());
    }

    #[test]
    fn test_cosine_similarity_proxy() {
        let config = CosineSimilarityConfig::default();

        let verdict = cosine_similarity("the cat sat", "the cat sat", &config);
        assert!(verdict.passed);
        assert_eq!(verdict.detail("similarity").unwrap(), &json!(1.0));
        assert!(verdict.detail("warning").is_some());

        let verdict = cosine_similarity("alpha beta", "gamma delta", &config);
        assert!(!verdict.passed);
        assert_eq!(verdict.detail("similarity").unwrap(), &json!(0.0));
    }

    #[test]
    fn test_cosine_similarity_threshold() {
        let config = CosineSimilarityConfig {
            threshold: 0.3,
            ..Default::default()
        };
        // 2 shared of 4 total words -> 0.5.
        let verdict = cosine_similarity("a b c", "a b d", &config);
        assert!(verdict.passed);

        let verdict = cosine_similarity("", "x", &config);
        assert!(!verdict.passed);
        assert!(verdict.detail("error").is_some());
    }

    #[test]
    fn test_assertion_prompt_shape() {
        let prompt = assertion_prompt("some text", "is polite");
        assert!(prompt.contains("some text"));
        assert!(prompt.contains("is polite"));
        assert!(prompt.contains("passed"));
        assert!(prompt.contains("explanation"));
    }
}
