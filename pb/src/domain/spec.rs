//! Typed column configurations
//!
//! Column `config` is stored as free-form JSON. [`ColumnSpec::parse`] is
//! the trust boundary: it turns `(kind, config)` into a tagged variant with
//! a strict shape, and nothing past this point sees an untyped map.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use promptstore::ColumnKind;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HumanInputConfig {
    pub default_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplateConfig {
    pub prompt_id: i64,
    /// Prompt variable name -> execution variable name.
    #[serde(default)]
    pub variable_mappings: std::collections::BTreeMap<String, String>,
    /// Merged over the prompt version's model params.
    #[serde(default)]
    pub model_override: Option<Map<String, Value>>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub project_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExactConfig {
    pub reference_column: Option<String>,
    pub expected_column: Option<String>,
    pub ignore_case: bool,
    pub ignore_whitespace: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedValueType {
    #[default]
    Column,
    FixedValue,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchPair {
    pub input_column: Option<String>,
    pub expected_value_type: ExpectedValueType,
    pub expected_column: Option<String>,
    pub fixed_expected_value: Option<Value>,
    pub enable_input_json_extraction: bool,
    pub input_json_path: Option<String>,
    pub enable_expected_json_extraction: bool,
    pub expected_json_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExactMultiConfig {
    pub match_pairs: Vec<MatchPair>,
    /// Global options: `ignore_case`, `ignore_whitespace`, `none_as_empty`.
    pub options: Vec<String>,
}

impl ExactMultiConfig {
    pub fn has_option(&self, name: &str) -> bool {
        self.options.iter().any(|o| o == name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainsConfig {
    pub reference_column: Option<String>,
    pub expected_column: Option<String>,
    pub ignore_case: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegexConfig {
    pub reference_column: Option<String>,
    pub expected_column: Option<String>,
    /// Falls back to the expected value when absent.
    pub pattern: Option<String>,
    pub ignore_case: bool,
    pub multiline: bool,
    pub dotall: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordsConfig {
    pub reference_column: Option<String>,
    pub expected_column: Option<String>,
    pub keywords: Vec<String>,
    /// Defaults to "all keywords" when absent.
    pub required_count: Option<usize>,
    pub ignore_case: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonStructureConfig {
    pub reference_column: Option<String>,
    pub expected_column: Option<String>,
    /// Explicit required fields; defaults to expected's top-level keys.
    pub required_fields: Option<Vec<String>>,
}

fn default_percentage_value() -> f64 {
    5.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NumericDistanceConfig {
    pub reference_column: Option<String>,
    pub expected_column: Option<String>,
    pub threshold: f64,
    pub percentage_threshold: bool,
    pub percentage_value: f64,
}

impl Default for NumericDistanceConfig {
    fn default() -> Self {
        Self {
            reference_column: None,
            expected_column: None,
            threshold: 0.0,
            percentage_threshold: false,
            percentage_value: default_percentage_value(),
        }
    }
}

fn default_project_id() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmAssertionConfig {
    pub assertion: String,
    #[serde(default = "default_project_id")]
    pub project_id: i64,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub reference_column: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
}

fn default_similarity_threshold() -> f64 {
    0.7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CosineSimilarityConfig {
    pub reference_column: Option<String>,
    pub expected_column: Option<String>,
    pub threshold: f64,
    pub embedding_model: Option<String>,
}

impl Default for CosineSimilarityConfig {
    fn default() -> Self {
        Self {
            reference_column: None,
            expected_column: None,
            threshold: default_similarity_threshold(),
            embedding_model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonExtractionConfig {
    pub json_path: String,
    #[serde(default)]
    pub reference_column: Option<String>,
    #[serde(default)]
    pub expected_column: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Number,
    Boolean,
    Json,
    #[default]
    String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseValueConfig {
    pub reference_column: Option<String>,
    pub expected_column: Option<String>,
    pub target_type: TargetType,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticValueConfig {
    pub static_value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationType {
    #[default]
    Json,
    Number,
    Sql,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeValidationConfig {
    pub reference_column: Option<String>,
    pub validation_type: ValidationType,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalesceConfig {
    pub reference_column: Option<String>,
    pub expected_column: Option<String>,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountType {
    #[default]
    Characters,
    Words,
    Paragraphs,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CountConfig {
    pub reference_column: Option<String>,
    pub expected_column: Option<String>,
    pub count_type: CountType,
}

/// A column's configuration, parsed into the variant its kind demands.
#[derive(Debug, Clone)]
pub enum ColumnSpec {
    DatasetVariable,
    HumanInput(HumanInputConfig),
    PromptTemplate(PromptTemplateConfig),
    Exact(ExactConfig),
    ExactMulti(ExactMultiConfig),
    Contains(ContainsConfig),
    Regex(RegexConfig),
    Keywords(KeywordsConfig),
    JsonStructure(JsonStructureConfig),
    NumericDistance(NumericDistanceConfig),
    LlmAssertion(LlmAssertionConfig),
    CosineSimilarity(CosineSimilarityConfig),
    JsonExtraction(JsonExtractionConfig),
    ParseValue(ParseValueConfig),
    StaticValue(StaticValueConfig),
    TypeValidation(TypeValidationConfig),
    Coalesce(CoalesceConfig),
    Count(CountConfig),
}

fn parse_config<T: serde::de::DeserializeOwned>(kind: ColumnKind, config: &Value) -> EngineResult<T> {
    let source = if config.is_null() {
        Value::Object(Map::new())
    } else {
        config.clone()
    };
    serde_json::from_value(source).map_err(|e| EngineError::Validation(format!("invalid {kind} config: {e}")))
}

impl ColumnSpec {
    /// Parse a column's raw config against its kind. This is the only
    /// place untyped column JSON is interpreted.
    pub fn parse(kind: ColumnKind, config: &Value) -> EngineResult<Self> {
        let spec = match kind {
            ColumnKind::DatasetVariable => ColumnSpec::DatasetVariable,
            ColumnKind::HumanInput => ColumnSpec::HumanInput(parse_config(kind, config)?),
            ColumnKind::PromptTemplate => ColumnSpec::PromptTemplate(parse_config(kind, config)?),
            ColumnKind::Exact => ColumnSpec::Exact(parse_config(kind, config)?),
            ColumnKind::ExactMulti => ColumnSpec::ExactMulti(parse_config(kind, config)?),
            ColumnKind::Contains => ColumnSpec::Contains(parse_config(kind, config)?),
            ColumnKind::Regex => ColumnSpec::Regex(parse_config(kind, config)?),
            ColumnKind::Keywords => ColumnSpec::Keywords(parse_config(kind, config)?),
            ColumnKind::JsonStructure => ColumnSpec::JsonStructure(parse_config(kind, config)?),
            ColumnKind::NumericDistance => ColumnSpec::NumericDistance(parse_config(kind, config)?),
            ColumnKind::LlmAssertion => ColumnSpec::LlmAssertion(parse_config(kind, config)?),
            ColumnKind::CosineSimilarity => ColumnSpec::CosineSimilarity(parse_config(kind, config)?),
            ColumnKind::JsonExtraction => ColumnSpec::JsonExtraction(parse_config(kind, config)?),
            ColumnKind::ParseValue => ColumnSpec::ParseValue(parse_config(kind, config)?),
            ColumnKind::StaticValue => ColumnSpec::StaticValue(parse_config(kind, config)?),
            ColumnKind::TypeValidation => ColumnSpec::TypeValidation(parse_config(kind, config)?),
            ColumnKind::Coalesce => ColumnSpec::Coalesce(parse_config(kind, config)?),
            ColumnKind::Count => ColumnSpec::Count(parse_config(kind, config)?),
        };
        Ok(spec)
    }

    /// The execution variable this column reads its input from.
    pub fn reference_column(&self) -> Option<&str> {
        match self {
            ColumnSpec::Exact(c) => c.reference_column.as_deref(),
            ColumnSpec::Contains(c) => c.reference_column.as_deref(),
            ColumnSpec::Regex(c) => c.reference_column.as_deref(),
            ColumnSpec::Keywords(c) => c.reference_column.as_deref(),
            ColumnSpec::JsonStructure(c) => c.reference_column.as_deref(),
            ColumnSpec::NumericDistance(c) => c.reference_column.as_deref(),
            ColumnSpec::LlmAssertion(c) => c.reference_column.as_deref(),
            ColumnSpec::CosineSimilarity(c) => c.reference_column.as_deref(),
            ColumnSpec::JsonExtraction(c) => c.reference_column.as_deref(),
            ColumnSpec::ParseValue(c) => c.reference_column.as_deref(),
            ColumnSpec::TypeValidation(c) => c.reference_column.as_deref(),
            ColumnSpec::Coalesce(c) => c.reference_column.as_deref(),
            ColumnSpec::Count(c) => c.reference_column.as_deref(),
            _ => None,
        }
    }

    /// The execution variable this column reads its expected value from.
    pub fn expected_column(&self) -> Option<&str> {
        match self {
            ColumnSpec::Exact(c) => c.expected_column.as_deref(),
            ColumnSpec::Contains(c) => c.expected_column.as_deref(),
            ColumnSpec::Regex(c) => c.expected_column.as_deref(),
            ColumnSpec::Keywords(c) => c.expected_column.as_deref(),
            ColumnSpec::JsonStructure(c) => c.expected_column.as_deref(),
            ColumnSpec::NumericDistance(c) => c.expected_column.as_deref(),
            ColumnSpec::CosineSimilarity(c) => c.expected_column.as_deref(),
            ColumnSpec::JsonExtraction(c) => c.expected_column.as_deref(),
            ColumnSpec::ParseValue(c) => c.expected_column.as_deref(),
            ColumnSpec::Coalesce(c) => c.expected_column.as_deref(),
            ColumnSpec::Count(c) => c.expected_column.as_deref(),
            _ => None,
        }
    }
}
