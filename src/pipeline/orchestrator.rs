//! Diagnosis orchestrator: drives one run through
//! Manual → Log → Code (optional) → Boss.
//!
//! A run is a plain synchronous state machine. Concurrency across runs comes
//! from the worker pool; the only state shared between runs is the feature
//! cache and the router's circuit breakers, both injected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::code_reader::{
    normalize_reference, CodeContextReader, CodeReaderConfig, CodeSnippetRequest,
};
use super::diagnostic::RunDump;
use super::feature_cache::{ExtractionError, FeatureSource, ManualFeatureCache};
use super::llm::{estimate_tokens, estimate_usage, EndpointError, GenerateRequest, LlmClient};
use super::noise_filter::{merge_patterns, FilterConfig, NoiseFilter, Pattern};
use super::router::{CallOutcome, ModelRouter};
use super::stages::{
    build_boss_prompt, build_code_prompt, build_correction_prompt, build_log_prompt,
    build_manual_prompt, CodeFindings, CodeReadFailure, LogVerdict, SchemaError, StagePayload,
    ValidationContext, Verdict,
};
use super::types::{
    DiagnosticRequest, Domain, LogDocument, Manual, PipelineRun, ResultSource, RunFailure,
    RunStatus, ScenarioConfig, Stage, StageResult, Validation,
};
use super::PipelineError;
use crate::config::DiagnosisConfig;

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_MANUAL_CHARS: usize = 15_000;
pub const DEFAULT_WORKERS: usize = 4;

/// `[pipeline]` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Corrective re-asks after the first attempt of a stage.
    pub max_retries: u32,
    pub call_timeout_secs: u64,
    pub max_manual_chars: usize,
    pub workers: usize,
    pub dump_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            max_manual_chars: DEFAULT_MAX_MANUAL_CHARS,
            workers: DEFAULT_WORKERS,
            dump_dir: None,
        }
    }
}

impl PipelineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Cooperative cancellation flag, checked at stage boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A file/line location named by the Log stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    pub path: String,
    pub line: usize,
}

/// `path/to/file.c:123`
static COLON_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z0-9_./\\-]+\.(?:c|cc|cpp|cxx|h|hpp|go|py|rs|java)):(\d+)")
        .expect("valid static regex")
});

/// `[ file.c / Function / 123 ]`
static BRACKET_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\s*([A-Za-z0-9_./\\-]+\.(?:c|cc|cpp|h|hpp))\s*/\s*[A-Za-z0-9_]+\s*/\s*(\d+)\s*\]")
        .expect("valid static regex")
});

/// Source locations referenced by a log verdict: the explicit
/// `file_path`/`line_number` first, then references found in the cited
/// evidence and the raw log line. Deduplicated, capped at `max_refs`.
pub fn collect_source_refs(
    verdict: &LogVerdict,
    strip_prefix: Option<&str>,
    max_refs: usize,
) -> Vec<SourceRef> {
    let mut refs: Vec<SourceRef> = Vec::new();
    let mut push = |path: &str, line: usize| {
        if refs.len() >= max_refs {
            return;
        }
        let path = normalize_reference(path, strip_prefix);
        if path.is_empty() {
            return;
        }
        let candidate = SourceRef { path, line };
        if !refs.contains(&candidate) {
            refs.push(candidate);
        }
    };

    if let Some(path) = verdict.file_path.as_deref().filter(|p| !p.trim().is_empty()) {
        push(path, verdict.line_number.map_or(1, |n| n as usize));
    }

    let texts = verdict
        .evidence_lines
        .iter()
        .map(|e| e.text.as_str())
        .chain(verdict.dotlog_content.as_deref());
    for text in texts {
        for re in [&*BRACKET_REF, &*COLON_REF] {
            for caps in re.captures_iter(text) {
                if let Ok(line) = caps[2].parse::<usize>() {
                    push(&caps[1], line);
                }
            }
        }
    }
    refs
}

/// Per-run routing inputs shared by every stage call.
struct RunScope<'a> {
    dump: Option<&'a RunDump>,
    preferences: &'a HashMap<Stage, Vec<String>>,
    domain: Domain,
}

pub struct PipelineOrchestrator {
    llm: Arc<dyn LlmClient + Send + Sync>,
    router: Arc<ModelRouter>,
    cache: Arc<ManualFeatureCache>,
    filter: NoiseFilter,
    code_reader: CodeContextReader,
    config: PipelineConfig,
}

impl PipelineOrchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient + Send + Sync>,
        router: Arc<ModelRouter>,
        cache: Arc<ManualFeatureCache>,
        filter: FilterConfig,
        code: CodeReaderConfig,
        config: PipelineConfig,
    ) -> Self {
        Self {
            llm,
            router,
            cache,
            filter: NoiseFilter::new(filter),
            code_reader: CodeContextReader::new(code),
            config,
        }
    }

    /// Build every service from a loaded configuration, each with empty state.
    pub fn from_config(config: &DiagnosisConfig, llm: Arc<dyn LlmClient + Send + Sync>) -> Self {
        Self::new(
            llm,
            Arc::new(ModelRouter::new(config.endpoints.clone(), &config.router)),
            Arc::new(ManualFeatureCache::new(config.cache.clone())),
            config.filter,
            config.code.clone(),
            config.pipeline.clone(),
        )
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    pub fn cache(&self) -> &ManualFeatureCache {
        &self.cache
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Create a run for `request` and execute it to a terminal status.
    pub fn run(&self, request: DiagnosticRequest, cancel: &CancellationToken) -> PipelineRun {
        let run = PipelineRun::new(&request);
        self.execute(run, &request, cancel)
    }

    /// Execute a run created at submission. Never panics on endpoint or
    /// model misbehaviour: every outcome is a terminal [`RunStatus`].
    pub fn execute(
        &self,
        mut run: PipelineRun,
        request: &DiagnosticRequest,
        cancel: &CancellationToken,
    ) -> PipelineRun {
        let _span = tracing::info_span!("diagnosis_run", run_id = %run.id).entered();
        let dump = RunDump::open(self.config.dump_dir.as_deref(), &run.id);
        if let Some(d) = &dump {
            d.json("00-request.json", &request_summary(&run, request));
        }

        tracing::info!(
            manual_hash = %run.manual_ref,
            log_hash = %run.log_ref,
            manual_chars = request.manual_text.chars().count(),
            log_bytes = request.log_text.len(),
            has_code_root = request.code_sandbox_root.is_some(),
            domain = ?request.scenario.domain,
            "Diagnosis run started"
        );
        run.status = RunStatus::Running;

        match self.drive(&mut run, request, cancel, dump.as_ref()) {
            Ok(verdict) => {
                tracing::info!(
                    is_fault = verdict.is_fault,
                    confidence = verdict.confidence,
                    "Verdict accepted"
                );
                run.final_verdict = Some(verdict);
                run.status = RunStatus::Succeeded;
            }
            Err(PipelineError::Cancelled) => {
                tracing::info!(stage = ?run.stage, "Diagnosis run cancelled");
                run.status = RunStatus::Cancelled;
            }
            Err(e) => {
                tracing::warn!(stage = ?run.stage, error = %e, "Diagnosis run failed");
                run.failure = Some(RunFailure {
                    stage: e.stage().or(run.stage),
                    reason: e.to_string(),
                });
                run.status = RunStatus::Failed;
            }
        }
        run.finished_at = Some(Utc::now());

        if let Some(d) = &dump {
            d.json("99-run.json", &run);
        }
        let usage = run.total_usage();
        tracing::info!(
            status = ?run.status,
            attempts = run.stage_results.len(),
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            estimated_cost_usd = usage.estimated_cost_usd,
            "Diagnosis run finished"
        );
        run
    }

    fn drive(
        &self,
        run: &mut PipelineRun,
        request: &DiagnosticRequest,
        cancel: &CancellationToken,
        dump: Option<&RunDump>,
    ) -> Result<Verdict, PipelineError> {
        if request.manual_text.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("manual text is empty".into()));
        }
        if request.log_text.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("log text is empty".into()));
        }

        let scenario = &request.scenario;
        let verdict_schema = scenario.verdict_schema();
        let scope = RunScope {
            dump,
            preferences: &scenario.model_preferences,
            domain: scenario.domain,
        };

        // ── MANUAL ──
        enter(run, Stage::Manual, cancel)?;
        let manual = Manual::new(request.manual_text.as_str());
        let mut attempts = Vec::new();
        let lookup = self.cache.get_features(&manual, |m| {
            let prompt = build_manual_prompt(
                &m.raw_text,
                &scenario.keyword_patterns,
                self.config.max_manual_chars,
            );
            let ctx = ValidationContext {
                judgment: None,
                log_line_count: 0,
                verdict_schema,
            };
            match self.run_stage(&scope, Stage::Manual, prompt, &ctx, &mut attempts) {
                Ok(StagePayload::Manual(judgment)) => Ok(judgment),
                Ok(_) => Err(ExtractionError::Exhausted {
                    attempts: 1,
                    last_error: "unexpected payload".into(),
                }),
                Err(PipelineError::NoAvailableEndpoint { .. }) => {
                    Err(ExtractionError::NoAvailableEndpoint)
                }
                Err(PipelineError::StageAborted {
                    attempts,
                    last_error,
                    ..
                }) => Err(ExtractionError::Exhausted {
                    attempts,
                    last_error,
                }),
                Err(other) => Err(ExtractionError::Exhausted {
                    attempts: 1,
                    last_error: other.to_string(),
                }),
            }
        });

        let extracted_here = !attempts.is_empty();
        run.stage_results.append(&mut attempts);
        let lookup = match lookup {
            Ok(lookup) => lookup,
            Err(e) => {
                if !extracted_here {
                    let mut result = stage_result(Stage::Manual, 1, ResultSource::Cache);
                    result.error = Some(e.to_string());
                    run.stage_results.push(result);
                }
                return Err(PipelineError::Extraction(e));
            }
        };
        if lookup.source != FeatureSource::Extracted {
            let mut result = stage_result(Stage::Manual, 1, ResultSource::Cache);
            result.payload = serde_json::to_value(&lookup.features.judgment).ok();
            result.validation = Validation::Ok;
            run.stage_results.push(result);
        }
        let features = lookup.features;

        let mut patterns: Vec<Pattern> = scenario
            .keyword_patterns
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(Pattern::literal)
            .collect();
        merge_patterns(&mut patterns, features.keyword_patterns.iter().cloned());

        // ── LOG ──
        enter(run, Stage::Log, cancel)?;
        let log = LogDocument::new(request.log_text.as_str());
        let evidence = self.filter.scan(&log, &patterns).collect();
        run.evidence_truncated = evidence.truncated;
        tracing::info!(
            patterns = patterns.len(),
            windows = evidence.windows.len(),
            evidence_lines = evidence.evidence_line_count(),
            total_lines = evidence.total_lines,
            truncated = evidence.truncated,
            fallback = evidence.fallback,
            "Log evidence extracted"
        );

        let ctx = ValidationContext {
            judgment: Some(&features.judgment),
            log_line_count: log.len(),
            verdict_schema,
        };
        let prompt = build_log_prompt(&features.judgment, &evidence);
        let StagePayload::Log(log_verdict) =
            self.run_stage(&scope, Stage::Log, prompt, &ctx, &mut run.stage_results)?
        else {
            return Err(unexpected_payload(Stage::Log));
        };

        // ── CODE (optional) ──
        let code = match request.code_sandbox_root.as_deref() {
            Some(root) => self.code_stage(run, root, &log_verdict, scenario, &scope, &ctx, cancel)?,
            None => None,
        };

        // ── BOSS ──
        enter(run, Stage::Boss, cancel)?;
        let prompt = build_boss_prompt(&features.judgment, &log_verdict, code.as_ref(), verdict_schema);
        let StagePayload::Boss(verdict) =
            self.run_stage(&scope, Stage::Boss, prompt, &ctx, &mut run.stage_results)?
        else {
            return Err(unexpected_payload(Stage::Boss));
        };

        // The call was already in flight; its result is discarded.
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(verdict)
    }

    /// Read every referenced location, then ask for an explanation of what
    /// could be read. Never fails the run except on cancellation.
    #[allow(clippy::too_many_arguments)]
    fn code_stage(
        &self,
        run: &mut PipelineRun,
        root: &Path,
        log_verdict: &LogVerdict,
        scenario: &ScenarioConfig,
        scope: &RunScope<'_>,
        ctx: &ValidationContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<Option<CodeFindings>, PipelineError> {
        let reader_config = self.code_reader.config();
        let strip_prefix = scenario
            .strip_prefix
            .as_deref()
            .or(reader_config.strip_prefix.as_deref());
        let refs = collect_source_refs(log_verdict, strip_prefix, reader_config.max_refs);
        if refs.is_empty() {
            tracing::debug!("No source references in log verdict, skipping code stage");
            return Ok(None);
        }

        enter(run, Stage::Code, cancel)?;
        let started_at = Utc::now();
        let mut findings = CodeFindings::default();
        for source_ref in refs {
            let request = CodeSnippetRequest {
                relative_path: source_ref.path.clone(),
                line: source_ref.line,
                radius: reader_config.snippet_radius,
            };
            match self.code_reader.read(root, &request) {
                Ok(snippet) => findings.snippets.push(snippet),
                Err(e) => {
                    tracing::warn!(
                        path = %source_ref.path,
                        line = source_ref.line,
                        kind = e.kind(),
                        "Source reference unreadable"
                    );
                    findings.failures.push(CodeReadFailure {
                        path: source_ref.path,
                        line: source_ref.line,
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let mut result = stage_result(Stage::Code, 1, ResultSource::SourceRead);
        result.started_at = started_at;
        result.payload = serde_json::to_value(&findings).ok();
        if !findings.snippets.is_empty() {
            result.validation = Validation::Ok;
        }
        if !findings.failures.is_empty() {
            let messages: Vec<&str> = findings.failures.iter().map(|f| f.message.as_str()).collect();
            result.error = Some(messages.join("; "));
        }
        run.stage_results.push(result);

        if !findings.snippets.is_empty() {
            let prompt = build_code_prompt(&findings.snippets, log_verdict);
            match self.run_stage(scope, Stage::Code, prompt, ctx, &mut run.stage_results) {
                Ok(StagePayload::Code(insight)) => findings.insight = Some(insight),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Code insight unavailable, continuing without it");
                }
            }
        }
        Ok(Some(findings))
    }

    /// One stage with its retry policy: up to `max_retries + 1` attempts,
    /// each routed separately. Schema failures re-ask with a corrective
    /// prompt; call failures are reported to the router and retried as-is.
    /// Every attempt is appended to `results`.
    fn run_stage(
        &self,
        scope: &RunScope<'_>,
        stage: Stage,
        prompt: String,
        ctx: &ValidationContext<'_>,
        results: &mut Vec<StageResult>,
    ) -> Result<StagePayload, PipelineError> {
        let system = stage.system_prompt(scope.domain);
        let preferences = scope.preferences.get(&stage).map(Vec::as_slice);
        let max_attempts = self.config.max_retries + 1;
        let timeout = self.config.call_timeout();

        let mut current = prompt.clone();
        let mut last_error: Option<PipelineError> = None;

        for attempt in 1..=max_attempts {
            let started_at = Utc::now();
            let estimated = estimate_tokens(&system).saturating_add(estimate_tokens(&current));

            let lease = match self.router.route_with(stage, preferences, estimated) {
                Ok(lease) => lease,
                Err(e) => {
                    let mut result = stage_result(stage, attempt, ResultSource::Generated);
                    result.started_at = started_at;
                    result.error = Some(e.to_string());
                    results.push(result);
                    return Err(PipelineError::NoAvailableEndpoint { stage });
                }
            };
            let endpoint = lease.endpoint();

            if let Some(d) = scope.dump {
                d.prompt(stage, attempt, &system, &current);
            }
            tracing::info!(
                %stage,
                attempt,
                endpoint = %endpoint.name,
                probe = lease.is_probe(),
                estimated_tokens = estimated,
                "Calling endpoint"
            );

            let response = self.llm.generate(&GenerateRequest {
                endpoint,
                stage,
                system: &system,
                prompt: &current,
                timeout,
            });

            let mut result = stage_result(stage, attempt, ResultSource::Generated);
            result.started_at = started_at;
            result.endpoint = Some(endpoint.name.clone());

            let raw = match response {
                Ok(raw) => raw,
                Err(e) => {
                    self.router.report(&lease, CallOutcome::Failure);
                    let err = match e {
                        EndpointError::Timeout { secs } => PipelineError::EndpointTimeout {
                            stage,
                            endpoint: endpoint.name.clone(),
                            secs,
                        },
                        error => PipelineError::Endpoint {
                            stage,
                            endpoint: endpoint.name.clone(),
                            error,
                        },
                    };
                    tracing::warn!(%stage, attempt, error = %err, "Endpoint call failed");
                    result.error = Some(err.to_string());
                    results.push(result);
                    last_error = Some(err);
                    continue;
                }
            };

            // A reply arrived; schema quality is not an endpoint health signal.
            self.router.report(&lease, CallOutcome::Success);
            if let Some(d) = scope.dump {
                d.response(stage, attempt, &raw);
            }
            result.usage = Some(estimate_usage(endpoint, &current, &raw));

            match stage.validate(&raw, ctx) {
                Ok(payload) => {
                    tracing::info!(%stage, attempt, endpoint = %endpoint.name, "Stage response accepted");
                    result.payload = Some(payload.to_value());
                    result.validation = Validation::Ok;
                    result.raw_response = Some(raw);
                    results.push(result);
                    return Ok(payload);
                }
                Err(e) => {
                    tracing::warn!(
                        %stage,
                        attempt,
                        error = %e,
                        response_len = raw.len(),
                        "Stage response failed schema validation"
                    );
                    current = build_correction_prompt(
                        &prompt,
                        &raw,
                        &e.to_string(),
                        stage.schema_text(ctx.verdict_schema),
                    );
                    result.error = Some(e.to_string());
                    result.raw_response = Some(raw);
                    results.push(result);
                    last_error = Some(PipelineError::SchemaValidation { stage, error: e });
                }
            }
        }

        Err(PipelineError::StageAborted {
            stage,
            attempts: max_attempts,
            last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}

// ──────────────────────────────────────────────
// Helpers
// ──────────────────────────────────────────────

fn enter(run: &mut PipelineRun, stage: Stage, cancel: &CancellationToken) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    run.stage = Some(stage);
    tracing::info!(%stage, "Stage started");
    Ok(())
}

fn stage_result(stage: Stage, attempt: u32, source: ResultSource) -> StageResult {
    let now = Utc::now();
    StageResult {
        stage,
        attempt,
        source,
        endpoint: None,
        payload: None,
        raw_response: None,
        validation: Validation::Invalid,
        error: None,
        usage: None,
        started_at: now,
        finished_at: now,
    }
}

fn unexpected_payload(stage: Stage) -> PipelineError {
    PipelineError::SchemaValidation {
        stage,
        error: SchemaError::Shape(format!("unexpected payload for {stage} stage")),
    }
}

/// Request facts for the audit dump. Contents are referenced by hash only.
fn request_summary(run: &PipelineRun, request: &DiagnosticRequest) -> serde_json::Value {
    serde_json::json!({
        "run_id": run.id,
        "manual_hash": run.manual_ref,
        "manual_chars": request.manual_text.chars().count(),
        "log_hash": run.log_ref,
        "log_lines": request.log_text.lines().count(),
        "code_root": request.code_sandbox_root,
        "scenario": request.scenario,
        "created_at": run.created_at,
    })
}
