//! Run audit dump: writes every prompt, raw response and the final run
//! record to disk for offline inspection.
//!
//! Disabled unless a dump directory is configured (`[pipeline] dump_dir` or
//! `LOGPILOT_DUMP_DIR`). Writers log failures and never fail the run.
//!
//! **Output structure**:
//! ```text
//! {dump_dir}/{run_id}/
//!   00-request.json
//!   MANUAL-1-prompt.txt
//!   MANUAL-1-response.txt
//!   LOG-1-prompt.txt
//!   LOG-1-response.txt
//!   LOG-2-prompt.txt        (corrective re-ask)
//!   ...
//!   99-run.json
//! ```

use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::types::Stage;

/// Dump handle for one run.
#[derive(Debug, Clone)]
pub struct RunDump {
    dir: PathBuf,
}

impl RunDump {
    /// Creates `{base}/{run_id}/`. Returns `None` when dumping is disabled or
    /// the directory cannot be created.
    pub fn open(base: Option<&Path>, run_id: &Uuid) -> Option<Self> {
        let dir = base?.join(run_id.to_string());
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(
                path = %dir.display(),
                error = %e,
                "Diagnostic dump: failed to create directory"
            );
            return None;
        }
        Some(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prompt(&self, stage: Stage, attempt: u32, system: &str, prompt: &str) {
        let text = format!("=== SYSTEM ===\n{system}\n=== USER ===\n{prompt}\n");
        dump_text(&self.dir, &format!("{stage}-{attempt}-prompt.txt"), &text);
    }

    pub fn response(&self, stage: Stage, attempt: u32, response: &str) {
        dump_text(&self.dir, &format!("{stage}-{attempt}-response.txt"), response);
    }

    pub fn json<T: serde::Serialize>(&self, filename: &str, value: &T) {
        dump_json(&self.dir, filename, value);
    }
}

// ──────────────────────────────────────────────
// Dump writers
// ──────────────────────────────────────────────

/// Write a JSON artifact, pretty-printed. Never panics.
pub fn dump_json<T: serde::Serialize>(dir: &Path, filename: &str, value: &T) {
    let path = dir.join(filename);
    match serde_json::to_string_pretty(value) {
        Ok(json) => match std::fs::write(&path, json.as_bytes()) {
            Ok(()) => tracing::debug!(
                path = %path.display(),
                size = json.len(),
                "Diagnostic dump: JSON written"
            ),
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "Diagnostic dump: failed to write JSON"
            ),
        },
        Err(e) => tracing::warn!(
            path = %path.display(),
            error = %e,
            "Diagnostic dump: failed to serialize JSON"
        ),
    }
}

/// Write a text artifact (prompt, raw response). Never panics.
pub fn dump_text(dir: &Path, filename: &str, text: &str) {
    let path = dir.join(filename);
    match std::fs::write(&path, text.as_bytes()) {
        Ok(()) => tracing::debug!(
            path = %path.display(),
            size = text.len(),
            "Diagnostic dump: text written"
        ),
        Err(e) => tracing::warn!(
            path = %path.display(),
            error = %e,
            "Diagnostic dump: failed to write text"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_without_base() {
        assert!(RunDump::open(None, &Uuid::new_v4()).is_none());
    }

    #[test]
    fn open_creates_run_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let run_id = Uuid::new_v4();
        let dump = RunDump::open(Some(tmp.path()), &run_id).unwrap();
        assert!(dump.dir().exists());
        assert!(dump.dir().ends_with(run_id.to_string()));
    }

    #[test]
    fn prompt_and_response_files_are_named_by_stage_and_attempt() {
        let tmp = tempfile::tempdir().unwrap();
        let dump = RunDump::open(Some(tmp.path()), &Uuid::new_v4()).unwrap();
        dump.prompt(Stage::Log, 2, "sys", "user");
        dump.response(Stage::Log, 2, "{}");

        let prompt = std::fs::read_to_string(dump.dir().join("LOG-2-prompt.txt")).unwrap();
        assert!(prompt.contains("=== SYSTEM ===\nsys"));
        assert!(prompt.contains("=== USER ===\nuser"));
        let response = std::fs::read_to_string(dump.dir().join("LOG-2-response.txt")).unwrap();
        assert_eq!(response, "{}");
    }

    #[test]
    fn dump_json_writes_pretty_json() {
        let tmp = tempfile::tempdir().unwrap();
        dump_json(tmp.path(), "info.json", &serde_json::json!({"name": "test", "value": 42}));
        let content = std::fs::read_to_string(tmp.path().join("info.json")).unwrap();
        assert!(content.contains("\"value\": 42"));
        assert!(content.contains('\n'));
    }

    #[test]
    fn writers_tolerate_missing_directory() {
        let bad_dir = Path::new("/nonexistent/path");
        dump_json(bad_dir, "test.json", &"data");
        dump_text(bad_dir, "test.txt", "data");
    }
}
