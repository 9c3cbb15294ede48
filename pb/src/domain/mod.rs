//! Engine-side domain types

mod spec;

pub use spec::{
    CoalesceConfig, ColumnSpec, ContainsConfig, CosineSimilarityConfig, CountConfig, CountType, ExactConfig,
    ExactMultiConfig, ExpectedValueType, HumanInputConfig, JsonExtractionConfig, JsonStructureConfig, KeywordsConfig,
    LlmAssertionConfig, MatchPair, NumericDistanceConfig, ParseValueConfig, PromptTemplateConfig, RegexConfig,
    StaticValueConfig, TargetType, TypeValidationConfig, ValidationType,
};
