use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::stages::schema::Verdict;

/// SHA-256 of the text, URL-safe base64 without padding (usable as a file name).
pub fn content_hash(text: &str) -> String {
    let hash = Sha256::digest(text.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hash)
}

// ──────────────────────────────────────────────
// Inputs
// ──────────────────────────────────────────────

/// A fault manual. Identified by content hash so identical manuals share cache entries.
#[derive(Debug, Clone)]
pub struct Manual {
    pub id: Uuid,
    pub content_hash: String,
    pub raw_text: String,
}

impl Manual {
    pub fn new(raw_text: impl Into<String>) -> Self {
        let raw_text = raw_text.into();
        Self {
            id: Uuid::new_v4(),
            content_hash: content_hash(&raw_text),
            raw_text,
        }
    }
}

/// An operational log split into lines (line `n` is `lines()[n - 1]`).
#[derive(Debug, Clone)]
pub struct LogDocument {
    lines: Vec<String>,
}

impl LogDocument {
    pub fn new(raw_text: impl AsRef<str>) -> Self {
        let lines = raw_text.as_ref().lines().map(str::to_string).collect();
        Self { lines }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// 1-based line lookup.
    pub fn line(&self, number: usize) -> Option<&str> {
        number
            .checked_sub(1)
            .and_then(|i| self.lines.get(i))
            .map(String::as_str)
    }
}

// ──────────────────────────────────────────────
// Stages & scenario
// ──────────────────────────────────────────────

/// Pipeline stage. Doubles as the router's task type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Manual,
    Log,
    Code,
    Boss,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Log => "LOG",
            Self::Code => "CODE",
            Self::Boss => "BOSS",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "log" => Ok(Self::Log),
            "code" => Ok(Self::Code),
            "boss" => Ok(Self::Boss),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

/// Equipment subsystem the manual covers. Selects the Boss system prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Domain {
    Bsp,
    Clk,
    Switch,
    #[default]
    Other,
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BSP" => Ok(Self::Bsp),
            "CLK" | "CLOCK" => Ok(Self::Clk),
            "SWITCH" | "SW" => Ok(Self::Switch),
            "OTHER" => Ok(Self::Other),
            other => Err(format!("unknown domain '{other}' (expected BSP, CLK, SWITCH, OTHER)")),
        }
    }
}

/// Final verdict shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSchema {
    /// `{is_fault, confidence, title, reason, fix}`
    Generic,
    /// Generic fields plus the clock-subsystem report.
    Clock,
}

impl Domain {
    pub fn default_verdict_schema(&self) -> VerdictSchema {
        match self {
            Self::Clk => VerdictSchema::Clock,
            _ => VerdictSchema::Generic,
        }
    }
}

/// Per-request scenario knobs supplied by the task layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub domain: Domain,
    /// Literal hints searched in addition to the patterns extracted from the manual.
    pub keyword_patterns: Vec<String>,
    /// Endpoint order per task type, overriding the router's configured order.
    pub model_preferences: HashMap<Stage, Vec<String>>,
    pub verdict_schema: Option<VerdictSchema>,
    /// Build-server path prefix removed from source references.
    pub strip_prefix: Option<String>,
}

impl ScenarioConfig {
    pub fn verdict_schema(&self) -> VerdictSchema {
        self.verdict_schema
            .unwrap_or_else(|| self.domain.default_verdict_schema())
    }
}

/// What the task layer submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticRequest {
    pub manual_text: String,
    pub log_text: String,
    #[serde(default)]
    pub scenario: ScenarioConfig,
    #[serde(default)]
    pub code_sandbox_root: Option<PathBuf>,
}

impl DiagnosticRequest {
    pub fn new(manual_text: impl Into<String>, log_text: impl Into<String>) -> Self {
        Self {
            manual_text: manual_text.into(),
            log_text: log_text.into(),
            scenario: ScenarioConfig::default(),
            code_sandbox_root: None,
        }
    }

    pub fn with_scenario(mut self, scenario: ScenarioConfig) -> Self {
        self.scenario = scenario;
        self
    }

    pub fn with_code_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.code_sandbox_root = Some(root.into());
        self
    }
}

// ──────────────────────────────────────────────
// Stage results
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Validation {
    Ok,
    Invalid,
}

/// Where a stage result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    /// A generation call issued by this run.
    Generated,
    /// Manual features served by the feature cache (hit, coalesced or persisted).
    Cache,
    /// Local source snippets read by the Code stage.
    SourceRead,
}

/// Estimated token usage of one generation call (chars / 2 heuristic).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CallUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub estimated_cost_usd: f64,
}

impl CallUsage {
    pub fn add(&mut self, other: &CallUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.estimated_cost_usd += other.estimated_cost_usd;
    }
}

/// One stage attempt. Immutable once pushed onto a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    /// 1-based attempt number within the stage.
    pub attempt: u32,
    pub source: ResultSource,
    pub endpoint: Option<String>,
    /// Schema-validated payload; `None` when validation failed.
    pub payload: Option<serde_json::Value>,
    pub raw_response: Option<String>,
    pub validation: Validation,
    pub error: Option<String>,
    pub usage: Option<CallUsage>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StageResult {
    pub fn is_ok(&self) -> bool {
        self.validation == Validation::Ok
    }
}

// ──────────────────────────────────────────────
// Pipeline run
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Human-readable terminal failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: Option<Stage>,
    pub reason: String,
}

/// One diagnostic run, created at submission and owned by the orchestrator
/// until it reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub manual_ref: String,
    pub log_ref: String,
    pub code_root_ref: Option<PathBuf>,
    pub status: RunStatus,
    /// Stage currently (or last) executing.
    pub stage: Option<Stage>,
    pub stage_results: Vec<StageResult>,
    pub final_verdict: Option<Verdict>,
    pub failure: Option<RunFailure>,
    /// The Log stage saw known-partial evidence.
    pub evidence_truncated: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(request: &DiagnosticRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            manual_ref: content_hash(&request.manual_text),
            log_ref: content_hash(&request.log_text),
            code_root_ref: request.code_sandbox_root.clone(),
            status: RunStatus::Pending,
            stage: None,
            stage_results: Vec::new(),
            final_verdict: None,
            failure: None,
            evidence_truncated: false,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// All attempts recorded for one stage, in order.
    pub fn results_for(&self, stage: Stage) -> impl Iterator<Item = &StageResult> {
        self.stage_results.iter().filter(move |r| r.stage == stage)
    }

    /// The validated payload of a stage, if any attempt succeeded.
    pub fn accepted(&self, stage: Stage) -> Option<&StageResult> {
        self.results_for(stage).find(|r| r.is_ok())
    }

    pub fn total_usage(&self) -> CallUsage {
        let mut total = CallUsage::default();
        for usage in self.stage_results.iter().filter_map(|r| r.usage.as_ref()) {
            total.add(usage);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_manuals_share_hash() {
        let a = Manual::new("PLL unlock -> holdover");
        let b = Manual::new("PLL unlock -> holdover");
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.id, b.id);
        assert!(!a.content_hash.contains('/'));
    }

    #[test]
    fn different_content_different_hash() {
        assert_ne!(content_hash("a"), content_hash("b"));
    }

    #[test]
    fn log_lines_are_one_based() {
        let log = LogDocument::new("first\nsecond\r\nthird");
        assert_eq!(log.len(), 3);
        assert_eq!(log.line(1), Some("first"));
        assert_eq!(log.line(2), Some("second"));
        assert_eq!(log.line(0), None);
        assert_eq!(log.line(4), None);
    }

    #[test]
    fn stage_parses_case_insensitively() {
        assert_eq!("boss".parse::<Stage>().unwrap(), Stage::Boss);
        assert_eq!("LOG".parse::<Stage>().unwrap(), Stage::Log);
        assert!("judge".parse::<Stage>().is_err());
    }

    #[test]
    fn clock_domain_selects_clock_schema() {
        let mut scenario = ScenarioConfig {
            domain: Domain::Clk,
            ..Default::default()
        };
        assert_eq!(scenario.verdict_schema(), VerdictSchema::Clock);
        scenario.verdict_schema = Some(VerdictSchema::Generic);
        assert_eq!(scenario.verdict_schema(), VerdictSchema::Generic);
        assert_eq!(
            ScenarioConfig::default().verdict_schema(),
            VerdictSchema::Generic
        );
    }

    #[test]
    fn new_run_is_pending_with_refs() {
        let request = DiagnosticRequest::new("manual", "log").with_code_root("/src");
        let run = PipelineRun::new(&request);
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.manual_ref, content_hash("manual"));
        assert_eq!(run.code_root_ref, Some(PathBuf::from("/src")));
        assert!(!run.status.is_terminal());
    }

    #[test]
    fn scenario_deserializes_stage_keyed_preferences() {
        let json = r#"{"domain": "CLK", "model_preferences": {"BOSS": ["gpt-4o"]}}"#;
        let scenario: ScenarioConfig = serde_json::from_str(json).unwrap();
        assert_eq!(scenario.domain, Domain::Clk);
        assert_eq!(scenario.model_preferences[&Stage::Boss], vec!["gpt-4o"]);
    }
}
