//! Stage variants: one fixed prompt set and one schema validator per stage,
//! selected by matching on [`Stage`].

pub mod parser;
pub mod prompt;
pub mod sanitize;
pub mod schema;

pub use parser::*;
pub use prompt::*;
pub use sanitize::*;
pub use schema::*;

use serde_json::Value;
use thiserror::Error;

use super::types::{Domain, Stage, VerdictSchema};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("No JSON object found in response")]
    NoJsonObject,

    #[error("Invalid JSON: {0}")]
    Json(String),

    #[error("Response does not match the schema: {0}")]
    Shape(String),

    #[error("Field '{field}' {reason}")]
    Field { field: String, reason: String },
}

/// Upstream facts a stage's payload is checked against.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    pub judgment: Option<&'a ManualJudgment>,
    pub log_line_count: usize,
    pub verdict_schema: VerdictSchema,
}

/// A validated stage payload.
#[derive(Debug, Clone, PartialEq)]
pub enum StagePayload {
    Manual(ManualJudgment),
    Log(LogVerdict),
    Code(CodeInsight),
    Boss(Verdict),
}

impl StagePayload {
    pub fn to_value(&self) -> Value {
        let value = match self {
            Self::Manual(p) => serde_json::to_value(p),
            Self::Log(p) => serde_json::to_value(p),
            Self::Code(p) => serde_json::to_value(p),
            Self::Boss(p) => serde_json::to_value(p),
        };
        value.unwrap_or(Value::Null)
    }
}

impl Stage {
    pub fn system_prompt(&self, domain: Domain) -> String {
        match self {
            Stage::Manual => MANUAL_SYSTEM_PROMPT.to_string(),
            Stage::Log => LOG_SYSTEM_PROMPT.to_string(),
            Stage::Code => CODE_SYSTEM_PROMPT.to_string(),
            Stage::Boss => boss_system_prompt(domain),
        }
    }

    /// Schema text quoted in corrective re-asks.
    pub fn schema_text(&self, verdict_schema: VerdictSchema) -> &'static str {
        match self {
            Stage::Manual => MANUAL_SCHEMA,
            Stage::Log => LOG_SCHEMA,
            Stage::Code => CODE_SCHEMA,
            Stage::Boss => verdict_schema_text(verdict_schema),
        }
    }

    /// Parse and validate a raw model response against this stage's schema.
    pub fn validate(
        &self,
        raw: &str,
        ctx: &ValidationContext<'_>,
    ) -> Result<StagePayload, SchemaError> {
        let value = extract_json(raw)?;
        match self {
            Stage::Manual => ManualJudgment::from_json(&value).map(StagePayload::Manual),
            Stage::Log => {
                let judgment = ctx.judgment.ok_or_else(|| SchemaError::Field {
                    field: "matched_rule_id".into(),
                    reason: "cannot be checked without manual rules".into(),
                })?;
                LogVerdict::from_json(&value, judgment, ctx.log_line_count).map(StagePayload::Log)
            }
            Stage::Code => CodeInsight::from_json(&value).map(StagePayload::Code),
            Stage::Boss => Verdict::from_json(&value, ctx.verdict_schema == VerdictSchema::Clock)
                .map(StagePayload::Boss),
        }
    }
}
