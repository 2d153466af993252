//! Log noise reduction: keyword + context extraction.
//!
//! Reduces a full log to a bounded set of evidence windows:
//! every line matching a pattern plus `context_radius` lines around it,
//! overlapping/adjacent windows merged, original line numbers preserved.
//!
//! Windows are produced lazily by [`WindowIter`]; an [`Evidence`] can be
//! iterated any number of times. The total number of emitted lines never
//! exceeds `max_total_lines`: earliest windows are kept, the window that
//! crosses the budget is clipped and the result is flagged `truncated`.
//! When nothing matches, the last `max_total_lines` lines are returned as a
//! single fallback window so downstream stages always get some evidence.

use std::fmt::Write as _;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::types::LogDocument;

// ──────────────────────────────────────────────
// Configuration
// ──────────────────────────────────────────────

/// Default lines of context kept before and after each matching line.
pub const DEFAULT_CONTEXT_RADIUS: usize = 5;

/// Default upper bound on lines handed to the Log stage.
pub const DEFAULT_MAX_TOTAL_LINES: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub context_radius: usize,
    pub max_total_lines: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            context_radius: DEFAULT_CONTEXT_RADIUS,
            max_total_lines: DEFAULT_MAX_TOTAL_LINES,
        }
    }
}

// ──────────────────────────────────────────────
// Patterns
// ──────────────────────────────────────────────

/// How a pattern value is matched against a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    /// Case-insensitive substring.
    Literal,
    /// Regular expression, matched as written.
    Regex,
    /// Error / register code, case-insensitive substring.
    Code,
}

/// Serialized form of a [`Pattern`]: `{"type": "literal", "value": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSpec {
    #[serde(rename = "type")]
    pub kind: PatternKind,
    pub value: String,
}

#[derive(Debug, Clone)]
enum Matcher {
    /// Lowercased needle.
    Substring(String),
    Regex(Regex),
}

/// A compiled judgment pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "PatternSpec", into = "PatternSpec")]
pub struct Pattern {
    kind: PatternKind,
    value: String,
    matcher: Matcher,
}

impl Pattern {
    pub fn new(kind: PatternKind, value: &str) -> Result<Self, regex::Error> {
        let matcher = match kind {
            PatternKind::Literal | PatternKind::Code => Matcher::Substring(value.to_lowercase()),
            PatternKind::Regex => Matcher::Regex(Regex::new(value)?),
        };
        Ok(Self {
            kind,
            value: value.to_string(),
            matcher,
        })
    }

    pub fn literal(value: &str) -> Self {
        Self {
            kind: PatternKind::Literal,
            value: value.to_string(),
            matcher: Matcher::Substring(value.to_lowercase()),
        }
    }

    pub fn code(value: &str) -> Self {
        Self {
            kind: PatternKind::Code,
            value: value.to_string(),
            matcher: Matcher::Substring(value.to_lowercase()),
        }
    }

    pub fn regex(value: &str) -> Result<Self, regex::Error> {
        Self::new(PatternKind::Regex, value)
    }

    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Match against a line and its precomputed lowercase form.
    fn matches(&self, line: &str, lowered: &str) -> bool {
        match &self.matcher {
            Matcher::Substring(needle) => !needle.is_empty() && lowered.contains(needle.as_str()),
            Matcher::Regex(re) => re.is_match(line),
        }
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.matches(line, &line.to_lowercase())
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.value == other.value
    }
}

impl Eq for Pattern {}

impl TryFrom<PatternSpec> for Pattern {
    type Error = regex::Error;

    fn try_from(spec: PatternSpec) -> Result<Self, Self::Error> {
        Pattern::new(spec.kind, &spec.value)
    }
}

impl From<Pattern> for PatternSpec {
    fn from(p: Pattern) -> Self {
        PatternSpec {
            kind: p.kind,
            value: p.value,
        }
    }
}

/// Append `extra` patterns to `base`, skipping empty values and duplicates.
/// Order of first appearance is kept.
pub fn merge_patterns(base: &mut Vec<Pattern>, extra: impl IntoIterator<Item = Pattern>) {
    for p in extra {
        if p.value.trim().is_empty() || base.contains(&p) {
            continue;
        }
        base.push(p);
    }
}

// ──────────────────────────────────────────────
// Output types
// ──────────────────────────────────────────────

/// A contiguous run of log lines handed to the Log stage.
/// Line numbers are 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateWindow {
    pub start_line: usize,
    pub end_line: usize,
    /// Pattern that opened the window. Empty for the tail fallback.
    pub matched_pattern: String,
    /// Every matching line inside the window (1-based).
    pub matched_lines: Vec<usize>,
    pub text: String,
}

impl CandidateWindow {
    pub fn line_count(&self) -> usize {
        self.end_line + 1 - self.start_line
    }

    pub fn contains(&self, line: usize) -> bool {
        (self.start_line..=self.end_line).contains(&line)
    }
}

/// Fully collected filter result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceSet {
    pub windows: Vec<CandidateWindow>,
    /// Evidence is known-partial (budget exhausted, or tail fallback of a longer log).
    pub truncated: bool,
    /// No pattern matched; `windows` holds the log tail.
    pub fallback: bool,
    /// Lines in the source log.
    pub total_lines: usize,
}

impl EvidenceSet {
    pub fn evidence_line_count(&self) -> usize {
        self.windows.iter().map(CandidateWindow::line_count).sum()
    }

    pub fn contains_line(&self, line: usize) -> bool {
        self.windows.iter().any(|w| w.contains(line))
    }

    /// Render windows for a prompt, one `L<n>| text` row per line, with
    /// elision markers between non-contiguous windows.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.fallback {
            let _ = writeln!(
                out,
                "(no manual pattern matched; showing the last {} of {} lines)",
                self.evidence_line_count(),
                self.total_lines
            );
        }
        let mut last_end = 0usize;
        for w in &self.windows {
            if w.start_line > last_end + 1 {
                let _ = writeln!(out, "... ({} lines omitted) ...", w.start_line - last_end - 1);
            }
            for (offset, line) in w.text.lines().enumerate() {
                let _ = writeln!(out, "L{}| {}", w.start_line + offset, line);
            }
            last_end = w.end_line;
        }
        if self.total_lines > last_end && !self.windows.is_empty() {
            let _ = writeln!(out, "... ({} lines omitted) ...", self.total_lines - last_end);
        }
        if self.truncated && !self.fallback {
            out.push_str("(evidence truncated: line budget exhausted)\n");
        }
        out
    }
}

// ──────────────────────────────────────────────
// Filter
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct NoiseFilter {
    config: FilterConfig,
}

impl NoiseFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> FilterConfig {
        self.config
    }

    /// Bind a log and an ordered pattern set. No work happens until iterated.
    pub fn scan<'a>(&self, log: &'a LogDocument, patterns: &'a [Pattern]) -> Evidence<'a> {
        Evidence {
            lines: log.lines(),
            patterns,
            config: self.config,
        }
    }
}

/// Restartable, lazily evaluated evidence over one log.
#[derive(Debug, Clone, Copy)]
pub struct Evidence<'a> {
    lines: &'a [String],
    patterns: &'a [Pattern],
    config: FilterConfig,
}

impl<'a> Evidence<'a> {
    /// A fresh iterator from the first line.
    pub fn windows(&self) -> WindowIter<'a> {
        WindowIter {
            lines: self.lines,
            patterns: self.patterns,
            radius: self.config.context_radius,
            max_total: self.config.max_total_lines,
            budget: self.config.max_total_lines,
            cursor: 0,
            pending: None,
            matched_any: false,
            truncated: false,
            fallback: false,
            done: false,
        }
    }

    pub fn collect(&self) -> EvidenceSet {
        let mut iter = self.windows();
        let windows: Vec<CandidateWindow> = iter.by_ref().collect();
        EvidenceSet {
            windows,
            truncated: iter.is_truncated(),
            fallback: iter.used_fallback(),
            total_lines: self.lines.len(),
        }
    }
}

impl<'a> IntoIterator for Evidence<'a> {
    type Item = CandidateWindow;
    type IntoIter = WindowIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.windows()
    }
}

/// Window being grown while scanning (0-based, inclusive).
#[derive(Debug)]
struct PendingWindow {
    start: usize,
    end: usize,
    pattern: usize,
    matched: Vec<usize>,
}

#[derive(Debug)]
pub struct WindowIter<'a> {
    lines: &'a [String],
    patterns: &'a [Pattern],
    radius: usize,
    max_total: usize,
    budget: usize,
    cursor: usize,
    pending: Option<PendingWindow>,
    matched_any: bool,
    truncated: bool,
    fallback: bool,
    done: bool,
}

impl WindowIter<'_> {
    /// True once the line budget clipped or dropped a window.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// True if the tail fallback was emitted.
    pub fn used_fallback(&self) -> bool {
        self.fallback
    }

    fn first_match(&self, line: &str) -> Option<usize> {
        let lowered = line.to_lowercase();
        self.patterns.iter().position(|p| p.matches(line, &lowered))
    }

    fn emit(&mut self, mut window: PendingWindow) -> Option<CandidateWindow> {
        let len = window.end - window.start + 1;
        if self.budget == 0 {
            self.truncated = true;
            self.done = true;
            return None;
        }
        if len > self.budget {
            window.end = window.start + self.budget - 1;
            let end = window.end;
            window.matched.retain(|&i| i <= end);
            self.truncated = true;
            self.budget = 0;
            self.done = true;
        } else {
            self.budget -= len;
        }

        let text = self.lines[window.start..=window.end].join("\n");
        let matched_pattern = self
            .patterns
            .get(window.pattern)
            .map(|p| p.value.clone())
            .unwrap_or_default();

        Some(CandidateWindow {
            start_line: window.start + 1,
            end_line: window.end + 1,
            matched_pattern,
            matched_lines: window.matched.iter().map(|i| i + 1).collect(),
            text,
        })
    }

    fn emit_fallback(&mut self) -> Option<CandidateWindow> {
        self.done = true;
        let total = self.lines.len();
        let take = total.min(self.max_total);
        if take == 0 {
            return None;
        }
        self.fallback = true;
        self.truncated = total > take;
        let start = total - take;
        Some(CandidateWindow {
            start_line: start + 1,
            end_line: total,
            matched_pattern: String::new(),
            matched_lines: Vec::new(),
            text: self.lines[start..].join("\n"),
        })
    }
}

impl Iterator for WindowIter<'_> {
    type Item = CandidateWindow;

    fn next(&mut self) -> Option<CandidateWindow> {
        if self.done {
            return None;
        }
        loop {
            // A match at line j joins the pending window iff j <= end + radius + 1.
            if let Some(pending) = &self.pending {
                if self.cursor > pending.end + self.radius + 1 || self.cursor >= self.lines.len() {
                    let window = self.pending.take()?;
                    return self.emit(window);
                }
            }

            if self.cursor >= self.lines.len() {
                if self.matched_any {
                    self.done = true;
                    return None;
                }
                return self.emit_fallback();
            }

            let i = self.cursor;
            self.cursor += 1;

            let Some(pattern) = self.first_match(&self.lines[i]) else {
                continue;
            };
            self.matched_any = true;
            let start = i.saturating_sub(self.radius);
            let end = (i + self.radius).min(self.lines.len() - 1);

            match self.pending.as_mut() {
                Some(pending) => {
                    pending.end = pending.end.max(end);
                    pending.matched.push(i);
                }
                None => {
                    self.pending = Some(PendingWindow {
                        start,
                        end,
                        pattern,
                        matched: vec![i],
                    });
                }
            }
        }
    }
}
