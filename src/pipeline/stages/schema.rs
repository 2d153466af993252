//! Fixed payload schemas for the four stages.
//!
//! Each payload is deserialized from the model's JSON and then checked with
//! `validate`, which enforces what serde cannot: ranges, uniqueness, and
//! references into the manual rules and the log.

use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::SchemaError;
use crate::pipeline::code_reader::CodeSnippet;
use crate::pipeline::noise_filter::{merge_patterns, Pattern, PatternKind};

fn field_error(field: impl Into<String>, reason: impl Into<String>) -> SchemaError {
    SchemaError::Field {
        field: field.into(),
        reason: reason.into(),
    }
}

fn from_value<T: for<'de> Deserialize<'de>>(value: &Value) -> Result<T, SchemaError> {
    T::deserialize(value).map_err(|e| SchemaError::Shape(e.to_string()))
}

fn check_confidence(confidence: u8) -> Result<(), SchemaError> {
    if confidence > 100 {
        return Err(field_error("confidence", "must be between 0 and 100"));
    }
    Ok(())
}

fn require_text(field: &str, value: &str) -> Result<(), SchemaError> {
    if value.trim().is_empty() {
        return Err(field_error(field, "must not be empty"));
    }
    Ok(())
}

/// Accepts `405`, `"405"` or `"1,405"`; anything else becomes `None`.
fn lenient_line_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(s)) => s.replace(',', "").trim().parse().ok(),
        _ => None,
    })
}

// ──────────────────────────────────────────────
// MANUAL: judgment rules
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleSeverity {
    Fatal,
    Error,
    Warn,
    Info,
    #[default]
    #[serde(other)]
    Unknown,
}

fn default_kind() -> PatternKind {
    PatternKind::Literal
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(rename = "type", default = "default_kind")]
    pub kind: PatternKind,
    pub value: String,
    /// The rule only fires when every `must` signature is present.
    #[serde(default)]
    pub must: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub name: String,
    pub op: String,
    pub value: Value,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgmentRule {
    pub rule_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub severity: RuleSeverity,
    #[serde(default)]
    pub signatures: Vec<Signature>,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default)]
    pub recovery_signatures: Vec<Signature>,
    #[serde(default)]
    pub ignore_signatures: Vec<Signature>,
    #[serde(default)]
    pub thresholds: Vec<Threshold>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Machine-readable rule set extracted from the manual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualJudgment {
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub rules: Vec<JudgmentRule>,
}

impl ManualJudgment {
    pub fn from_json(value: &Value) -> Result<Self, SchemaError> {
        let judgment: Self = from_value(value)?;
        judgment.validate()?;
        Ok(judgment)
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.rules.is_empty() {
            return Err(field_error("rules", "must contain at least one rule"));
        }

        let mut seen = HashSet::new();
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.rule_id.trim().is_empty() {
                return Err(field_error(format!("rules[{i}].rule_id"), "must not be empty"));
            }
            if !seen.insert(rule.rule_id.as_str()) {
                return Err(field_error(
                    format!("rules[{i}].rule_id"),
                    format!("duplicate id '{}'", rule.rule_id),
                ));
            }

            let groups = [
                ("signatures", &rule.signatures),
                ("recovery_signatures", &rule.recovery_signatures),
                ("ignore_signatures", &rule.ignore_signatures),
            ];
            for (group, signatures) in groups {
                for (j, sig) in signatures.iter().enumerate() {
                    let field = format!("rules[{i}].{group}[{j}].value");
                    require_text(&field, &sig.value)?;
                    if sig.kind == PatternKind::Regex {
                        regex::Regex::new(&sig.value)
                            .map_err(|e| field_error(field, format!("invalid regex: {e}")))?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn rule_ids(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.rule_id.as_str())
    }

    pub fn has_rule(&self, rule_id: &str) -> bool {
        self.rule_ids().any(|id| id == rule_id)
    }

    /// Search patterns for the noise filter: fault and recovery signatures,
    /// in rule order, deduplicated.
    pub fn keyword_patterns(&self) -> Vec<Pattern> {
        let mut patterns = Vec::new();
        for rule in &self.rules {
            let compiled = rule
                .signatures
                .iter()
                .chain(&rule.recovery_signatures)
                .filter_map(|sig| Pattern::new(sig.kind, sig.value.trim()).ok());
            merge_patterns(&mut patterns, compiled);
        }
        patterns
    }
}

// ──────────────────────────────────────────────
// LOG: evidence verdict
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceLine {
    /// 1-based line number in the original log.
    pub line: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogVerdict {
    pub is_fault: bool,
    pub confidence: u8,
    #[serde(default)]
    pub matched_rule_id: Option<String>,
    #[serde(default)]
    pub match_reason: String,
    #[serde(default)]
    pub error_time: Option<String>,
    #[serde(default)]
    pub module_id: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub dotlog_content: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default, deserialize_with = "lenient_line_number")]
    pub line_number: Option<u32>,
    #[serde(default)]
    pub evidence_lines: Vec<EvidenceLine>,
}

impl LogVerdict {
    pub fn from_json(
        value: &Value,
        judgment: &ManualJudgment,
        log_line_count: usize,
    ) -> Result<Self, SchemaError> {
        let verdict: Self = from_value(value)?;
        verdict.validate(judgment, log_line_count)?;
        Ok(verdict)
    }

    pub fn validate(
        &self,
        judgment: &ManualJudgment,
        log_line_count: usize,
    ) -> Result<(), SchemaError> {
        check_confidence(self.confidence)?;

        if let Some(id) = self.matched_rule_id.as_deref().filter(|id| !id.trim().is_empty()) {
            if !judgment.has_rule(id) {
                return Err(field_error(
                    "matched_rule_id",
                    format!("'{id}' is not one of the manual rules"),
                ));
            }
        }

        if self.is_fault && self.evidence_lines.is_empty() {
            return Err(field_error(
                "evidence_lines",
                "must cite at least one log line when is_fault is true",
            ));
        }
        for (i, ev) in self.evidence_lines.iter().enumerate() {
            if ev.line == 0 || ev.line > log_line_count {
                return Err(field_error(
                    format!("evidence_lines[{i}].line"),
                    format!("{} is outside the log (1..={log_line_count})", ev.line),
                ));
            }
        }
        Ok(())
    }

    /// Rule id, ignoring the empty string some models emit instead of null.
    pub fn matched_rule(&self) -> Option<&str> {
        self.matched_rule_id.as_deref().filter(|id| !id.trim().is_empty())
    }
}

// ──────────────────────────────────────────────
// CODE: source insight
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeInsight {
    pub summary: String,
    #[serde(default)]
    pub trigger_condition: Option<String>,
    #[serde(default)]
    pub suspect_values: Vec<String>,
}

impl CodeInsight {
    pub fn from_json(value: &Value) -> Result<Self, SchemaError> {
        let insight: Self = from_value(value)?;
        require_text("summary", &insight.summary)?;
        Ok(insight)
    }
}

/// A source reference the Code stage could not read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeReadFailure {
    pub path: String,
    pub line: usize,
    pub kind: String,
    pub message: String,
}

/// What the Code stage gathered: snippets read, references that failed, and
/// the optional model explanation. Partial by nature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeFindings {
    pub snippets: Vec<CodeSnippet>,
    pub failures: Vec<CodeReadFailure>,
    pub insight: Option<CodeInsight>,
}

impl CodeFindings {
    pub fn is_empty(&self) -> bool {
        self.snippets.is_empty() && self.failures.is_empty()
    }
}

// ──────────────────────────────────────────────
// BOSS: final verdict
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FaultSeverity {
    Fatal,
    Error,
    Warn,
}

/// Clock-subsystem fields carried alongside the generic verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockFaultReport {
    pub fault_type: String,
    pub severity: FaultSeverity,
    pub module: String,
    #[serde(default)]
    pub sub_module: String,
    #[serde(default)]
    pub clock_state_before: String,
    #[serde(default)]
    pub clock_state_after: String,
    pub root_cause: String,
    pub evidence: Vec<String>,
    #[serde(default)]
    pub impact: String,
    #[serde(default)]
    pub recommended_action: Vec<String>,
}

/// The generic verdict fields, shared by both variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct GenericVerdict {
    is_fault: bool,
    confidence: u8,
    title: String,
    reason: String,
    #[serde(default)]
    fix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub is_fault: bool,
    pub confidence: u8,
    pub title: String,
    pub reason: String,
    pub fix: String,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub clock: Option<ClockFaultReport>,
}

impl Verdict {
    pub fn from_json(value: &Value, with_clock: bool) -> Result<Self, SchemaError> {
        let generic: GenericVerdict = from_value(value)?;
        check_confidence(generic.confidence)?;
        require_text("title", &generic.title)?;
        require_text("reason", &generic.reason)?;

        let clock = if with_clock {
            let report: ClockFaultReport = from_value(value)?;
            require_text("fault_type", &report.fault_type)?;
            require_text("root_cause", &report.root_cause)?;
            if report.evidence.iter().all(|e| e.trim().is_empty()) {
                return Err(field_error("evidence", "must contain at least one entry"));
            }
            Some(report)
        } else {
            None
        };

        Ok(Self {
            is_fault: generic.is_fault,
            confidence: generic.confidence,
            title: generic.title,
            reason: generic.reason,
            fix: generic.fix,
            clock,
        })
    }
}
