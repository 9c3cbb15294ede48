//! Pipelines and their typed columns
//!
//! A pipeline is an ordered evaluation plan bound to a dataset. Columns are
//! the steps; `position` is unique within a pipeline and defines execution
//! order.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::{ParseEnumError, now_ms};

/// The kind of a pipeline column.
///
/// Legacy spellings from older exports (`exact_match`, `exact_multi_match`,
/// `regex_match`) are accepted on parse and canonicalised; they are never
/// written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    DatasetVariable,
    HumanInput,
    PromptTemplate,
    #[serde(alias = "exact_match")]
    Exact,
    #[serde(alias = "exact_multi_match")]
    ExactMulti,
    Contains,
    #[serde(alias = "regex_match")]
    Regex,
    Keywords,
    JsonStructure,
    NumericDistance,
    LlmAssertion,
    CosineSimilarity,
    JsonExtraction,
    ParseValue,
    StaticValue,
    TypeValidation,
    Coalesce,
    Count,
}

impl ColumnKind {
    /// Columns whose value is `{value: bool}` and which may close a pipeline.
    pub fn is_boolean(&self) -> bool {
        matches!(self, Self::Exact | Self::ExactMulti | Self::Contains | Self::Regex)
    }

    /// Columns that invoke an LLM and must pass the rate limiter.
    pub fn is_llm_bearing(&self) -> bool {
        matches!(self, Self::PromptTemplate | Self::LlmAssertion)
    }

    /// Columns whose cells are written deterministically at result creation
    /// and never get a task of their own.
    pub fn is_static(&self) -> bool {
        matches!(self, Self::DatasetVariable | Self::HumanInput)
    }
}

impl std::fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DatasetVariable => "dataset_variable",
            Self::HumanInput => "human_input",
            Self::PromptTemplate => "prompt_template",
            Self::Exact => "exact",
            Self::ExactMulti => "exact_multi",
            Self::Contains => "contains",
            Self::Regex => "regex",
            Self::Keywords => "keywords",
            Self::JsonStructure => "json_structure",
            Self::NumericDistance => "numeric_distance",
            Self::LlmAssertion => "llm_assertion",
            Self::CosineSimilarity => "cosine_similarity",
            Self::JsonExtraction => "json_extraction",
            Self::ParseValue => "parse_value",
            Self::StaticValue => "static_value",
            Self::TypeValidation => "type_validation",
            Self::Coalesce => "coalesce",
            Self::Count => "count",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ColumnKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "dataset_variable" => Self::DatasetVariable,
            "human_input" => Self::HumanInput,
            "prompt_template" => Self::PromptTemplate,
            "exact" | "exact_match" => Self::Exact,
            "exact_multi" | "exact_multi_match" => Self::ExactMulti,
            "contains" => Self::Contains,
            "regex" | "regex_match" => Self::Regex,
            "keywords" => Self::Keywords,
            "json_structure" => Self::JsonStructure,
            "numeric_distance" => Self::NumericDistance,
            "llm_assertion" => Self::LlmAssertion,
            "cosine_similarity" => Self::CosineSimilarity,
            "json_extraction" => Self::JsonExtraction,
            "parse_value" => Self::ParseValue,
            "static_value" => Self::StaticValue,
            "type_validation" => Self::TypeValidation,
            "coalesce" => Self::Coalesce,
            "count" => Self::Count,
            other => return Err(ParseEnumError::new("column kind", other)),
        };
        Ok(kind)
    }
}

/// An evaluation pipeline over one dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: i64,
    pub project_id: i64,
    pub dataset_id: i64,
    pub user_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Pipeline {
    pub fn new(project_id: i64, dataset_id: i64, user_id: i64, name: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: 0,
            project_id,
            dataset_id,
            user_id,
            name: name.into(),
            description: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One typed step of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub id: i64,
    pub pipeline_id: i64,
    pub name: String,
    pub kind: ColumnKind,
    pub position: i64,
    /// Raw configuration; parsed into a typed spec at the engine boundary.
    pub config: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Column {
    pub fn new(pipeline_id: i64, name: impl Into<String>, kind: ColumnKind, position: i64) -> Self {
        let now = now_ms();
        Self {
            id: 0,
            pipeline_id,
            name: name.into(),
            kind,
            position,
            config: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_kind_roundtrip() {
        for kind in [
            ColumnKind::DatasetVariable,
            ColumnKind::PromptTemplate,
            ColumnKind::Exact,
            ColumnKind::ExactMulti,
            ColumnKind::JsonExtraction,
            ColumnKind::Count,
        ] {
            let parsed: ColumnKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_column_kind_legacy_aliases() {
        assert_eq!("exact_match".parse::<ColumnKind>().unwrap(), ColumnKind::Exact);
        assert_eq!("regex_match".parse::<ColumnKind>().unwrap(), ColumnKind::Regex);
        assert_eq!(
            "exact_multi_match".parse::<ColumnKind>().unwrap(),
            ColumnKind::ExactMulti
        );
    }

    #[test]
    fn test_column_kind_unknown_rejected() {
        assert!("code_execution".parse::<ColumnKind>().is_err());
    }

    #[test]
    fn test_boolean_kinds() {
        assert!(ColumnKind::Exact.is_boolean());
        assert!(ColumnKind::ExactMulti.is_boolean());
        assert!(ColumnKind::Contains.is_boolean());
        assert!(ColumnKind::Regex.is_boolean());
        assert!(!ColumnKind::Keywords.is_boolean());
        assert!(!ColumnKind::PromptTemplate.is_boolean());
    }

    #[test]
    fn test_llm_bearing_kinds() {
        assert!(ColumnKind::PromptTemplate.is_llm_bearing());
        assert!(ColumnKind::LlmAssertion.is_llm_bearing());
        assert!(!ColumnKind::Exact.is_llm_bearing());
    }
}
