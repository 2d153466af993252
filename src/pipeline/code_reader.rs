//! Sandboxed source snippet reader for the Code stage.
//!
//! Every request is resolved against a caller-supplied root. Traversal
//! segments are rejected lexically before touching the filesystem, then each
//! component is walked from the canonical root and every symlink met must
//! resolve inside it. Only regular files below `max_file_bytes` are read.

use std::fmt::Write as _;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MAX_FILE_BYTES: u64 = 1024 * 1024;
pub const DEFAULT_SNIPPET_RADIUS: usize = 15;
pub const DEFAULT_MAX_REFS: usize = 4;

#[derive(Error, Debug)]
pub enum CodeReadError {
    #[error("Path escapes the sandbox root: {path}")]
    PathSandboxViolation { path: String },

    #[error("File not found: {path}")]
    NotFound { path: String },

    #[error("File too large: {path} ({size} bytes, limit {limit})")]
    FileTooLarge { path: String, size: u64, limit: u64 },

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl CodeReadError {
    /// Short machine-readable kind for stage records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PathSandboxViolation { .. } => "PathSandboxViolation",
            Self::NotFound { .. } => "NotFound",
            Self::FileTooLarge { .. } => "FileTooLarge",
            Self::Io { .. } => "Io",
        }
    }
}

/// `[code]` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeReaderConfig {
    pub max_file_bytes: u64,
    pub snippet_radius: usize,
    /// Upper bound on references read per run.
    pub max_refs: usize,
    /// Build-server prefix removed from referenced paths.
    pub strip_prefix: Option<String>,
}

impl Default for CodeReaderConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            snippet_radius: DEFAULT_SNIPPET_RADIUS,
            max_refs: DEFAULT_MAX_REFS,
            strip_prefix: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSnippetRequest {
    pub relative_path: String,
    /// 1-based focus line.
    pub line: usize,
    pub radius: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnippetLine {
    pub number: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSnippet {
    /// Path relative to the sandbox root, `/`-separated.
    pub path: String,
    pub focus_line: usize,
    pub lines: Vec<SnippetLine>,
}

impl CodeSnippet {
    /// Numbered listing with `>> ` on the focus line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            let marker = if line.number == self.focus_line { ">> " } else { "   " };
            let _ = writeln!(out, "{marker}{}: {}", line.number, line.text);
        }
        out
    }
}

/// Map a referenced path onto the checkout: drop `strip_prefix`, normalize
/// separators to `/`, and remove leading separators.
pub fn normalize_reference(path: &str, strip_prefix: Option<&str>) -> String {
    let mut rest = path.trim();
    if let Some(prefix) = strip_prefix.filter(|p| !p.is_empty()) {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
        }
    }
    rest.replace('\\', "/").trim_start_matches('/').to_string()
}

pub struct CodeContextReader {
    config: CodeReaderConfig,
}

impl CodeContextReader {
    pub fn new(config: CodeReaderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CodeReaderConfig {
        &self.config
    }

    pub fn read(
        &self,
        sandbox_root: &Path,
        request: &CodeSnippetRequest,
    ) -> Result<CodeSnippet, CodeReadError> {
        let relative =
            normalize_reference(&request.relative_path, self.config.strip_prefix.as_deref());
        let lexical = lexical_join(&relative).ok_or_else(|| {
            tracing::warn!(path = %request.relative_path, "Rejected traversal outside sandbox");
            CodeReadError::PathSandboxViolation {
                path: request.relative_path.clone(),
            }
        })?;

        let root = sandbox_root
            .canonicalize()
            .map_err(|e| io_error(&sandbox_root.display().to_string(), e))?;
        let resolved = resolve_within(&root, &lexical, &relative)?;

        let file = File::open(&resolved).map_err(|e| io_error(&relative, e))?;
        let meta = file.metadata().map_err(|e| io_error(&relative, e))?;
        if !meta.is_file() {
            return Err(CodeReadError::NotFound { path: relative });
        }
        let limit = self.config.max_file_bytes;
        if meta.len() > limit {
            return Err(CodeReadError::FileTooLarge {
                path: relative,
                size: meta.len(),
                limit,
            });
        }

        // The file may grow after the metadata check.
        let mut bytes = Vec::with_capacity(meta.len() as usize);
        file.take(limit.saturating_add(1))
            .read_to_end(&mut bytes)
            .map_err(|e| io_error(&relative, e))?;
        if bytes.len() as u64 > limit {
            return Err(CodeReadError::FileTooLarge {
                path: relative,
                size: bytes.len() as u64,
                limit,
            });
        }

        let content = String::from_utf8_lossy(&bytes);
        let all: Vec<&str> = content.lines().collect();

        let focus_line = request.line.clamp(1, all.len().max(1));
        let start = focus_line.saturating_sub(request.radius).max(1);
        let end = (focus_line + request.radius).min(all.len());
        let lines = (start..=end)
            .map(|n| SnippetLine {
                number: n,
                text: all[n - 1].to_string(),
            })
            .collect();

        tracing::debug!(path = %relative, focus_line, "Read source snippet");
        Ok(CodeSnippet {
            path: lexical.to_string_lossy().replace('\\', "/"),
            focus_line,
            lines,
        })
    }
}

/// Resolve `.`/`..` lexically. `None` when the path is absolute or climbs
/// above its starting directory.
fn lexical_join(relative: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                depth = depth.checked_sub(1)?;
                out.pop();
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (depth > 0).then_some(out)
}

/// Walk `lexical` below the canonical `root` one component at a time.
/// Symlinks are resolved as they are met and must land inside `root`;
/// one that cannot be resolved counts as an escape. A missing component is
/// only reported after every component before it was proven inside the root.
fn resolve_within(
    root: &Path,
    lexical: &Path,
    relative: &str,
) -> Result<PathBuf, CodeReadError> {
    let escape = || {
        tracing::warn!(path = %relative, "Rejected symlink escape from sandbox");
        CodeReadError::PathSandboxViolation {
            path: relative.to_string(),
        }
    };

    let mut current = root.to_path_buf();
    for component in lexical.components() {
        let candidate = current.join(component);
        let meta = std::fs::symlink_metadata(&candidate).map_err(|e| io_error(relative, e))?;
        current = if meta.file_type().is_symlink() {
            let target = candidate.canonicalize().map_err(|_| escape())?;
            if !target.starts_with(root) {
                return Err(escape());
            }
            target
        } else {
            candidate
        };
    }
    Ok(current)
}

fn io_error(path: &str, e: std::io::Error) -> CodeReadError {
    if e.kind() == std::io::ErrorKind::NotFound {
        CodeReadError::NotFound {
            path: path.to_string(),
        }
    } else {
        CodeReadError::Io {
            path: path.to_string(),
            source: e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sandbox() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src/driver/clk");
        fs::create_dir_all(&src).unwrap();
        let body: String = (1..=100).map(|i| format!("line {i}\n")).collect();
        fs::write(src.join("clk_core.c"), body).unwrap();
        dir
    }

    fn request(path: &str, line: usize, radius: usize) -> CodeSnippetRequest {
        CodeSnippetRequest {
            relative_path: path.to_string(),
            line,
            radius,
        }
    }

    #[test]
    fn reads_window_around_line() {
        let dir = sandbox();
        let reader = CodeContextReader::new(CodeReaderConfig::default());
        let snippet = reader
            .read(dir.path(), &request("src/driver/clk/clk_core.c", 50, 3))
            .unwrap();
        assert_eq!(snippet.path, "src/driver/clk/clk_core.c");
        assert_eq!(snippet.lines.len(), 7);
        assert_eq!(snippet.lines[0].number, 47);
        assert_eq!(snippet.lines[3].text, "line 50");
        assert!(snippet.render().contains(">> 50: line 50"));
    }

    #[test]
    fn clamps_to_file_bounds() {
        let dir = sandbox();
        let reader = CodeContextReader::new(CodeReaderConfig::default());
        let head = reader
            .read(dir.path(), &request("src/driver/clk/clk_core.c", 2, 5))
            .unwrap();
        assert_eq!(head.lines.first().unwrap().number, 1);
        assert_eq!(head.lines.len(), 7);

        let tail = reader
            .read(dir.path(), &request("src/driver/clk/clk_core.c", 500, 5))
            .unwrap();
        assert_eq!(tail.focus_line, 100);
        assert_eq!(tail.lines.last().unwrap().number, 100);
        assert_eq!(tail.lines.len(), 6);
    }

    #[test]
    fn traversal_is_rejected_without_reading() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("repo");
        fs::create_dir_all(&root).unwrap();
        fs::write(outer.path().join("secret.txt"), "top secret").unwrap();

        let reader = CodeContextReader::new(CodeReaderConfig::default());
        for path in ["../secret.txt", "src/../../secret.txt", "/etc/passwd"] {
            let err = reader.read(&root, &request(path, 1, 1)).unwrap_err();
            // "/etc/passwd" loses its leading separator and is simply missing.
            assert!(
                matches!(
                    err,
                    CodeReadError::PathSandboxViolation { .. } | CodeReadError::NotFound { .. }
                ),
                "{path}: {err}"
            );
        }
        let err = reader.read(&root, &request("../secret.txt", 1, 1)).unwrap_err();
        assert!(matches!(err, CodeReadError::PathSandboxViolation { .. }));
    }

    #[test]
    fn traversal_rejected_even_when_root_missing() {
        let reader = CodeContextReader::new(CodeReaderConfig::default());
        let err = reader
            .read(Path::new("/nonexistent/root"), &request("../../etc/passwd", 1, 1))
            .unwrap_err();
        assert!(matches!(err, CodeReadError::PathSandboxViolation { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("repo");
        fs::create_dir_all(&root).unwrap();
        fs::write(outer.path().join("secret.txt"), "top secret").unwrap();
        std::os::unix::fs::symlink(outer.path().join("secret.txt"), root.join("link.c")).unwrap();

        let reader = CodeContextReader::new(CodeReaderConfig::default());
        let err = reader.read(&root, &request("link.c", 1, 1)).unwrap_err();
        assert!(matches!(err, CodeReadError::PathSandboxViolation { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directory_escape_hides_existence() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("repo");
        let outside = outer.path().join("outside");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("present.c"), "int x;\n").unwrap();
        std::os::unix::fs::symlink("../outside", root.join("ext")).unwrap();

        let reader = CodeContextReader::new(CodeReaderConfig::default());
        let present = reader.read(&root, &request("ext/present.c", 1, 1)).unwrap_err();
        let missing = reader.read(&root, &request("ext/missing.c", 1, 1)).unwrap_err();
        assert_eq!(present.kind(), "PathSandboxViolation");
        assert_eq!(missing.kind(), "PathSandboxViolation");
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_is_an_escape() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("repo");
        fs::create_dir_all(&root).unwrap();
        std::os::unix::fs::symlink(outer.path().join("gone.c"), root.join("gone.c")).unwrap();

        let reader = CodeContextReader::new(CodeReaderConfig::default());
        let err = reader.read(&root, &request("gone.c", 1, 1)).unwrap_err();
        assert_eq!(err.kind(), "PathSandboxViolation");
    }

    #[cfg(unix)]
    #[test]
    fn symlink_inside_root_is_followed() {
        let dir = sandbox();
        std::os::unix::fs::symlink("src/driver", dir.path().join("drv")).unwrap();

        let reader = CodeContextReader::new(CodeReaderConfig::default());
        let snippet = reader.read(dir.path(), &request("drv/clk/clk_core.c", 3, 0)).unwrap();
        assert_eq!(snippet.path, "drv/clk/clk_core.c");
        assert_eq!(snippet.lines[0].text, "line 3");
    }

    #[test]
    fn missing_file_and_directory_are_not_found() {
        let dir = sandbox();
        let reader = CodeContextReader::new(CodeReaderConfig::default());
        let err = reader.read(dir.path(), &request("src/missing.c", 1, 1)).unwrap_err();
        assert_eq!(err.kind(), "NotFound");
        let err = reader.read(dir.path(), &request("src/driver", 1, 1)).unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[test]
    fn oversize_file_is_rejected() {
        let dir = sandbox();
        let reader = CodeContextReader::new(CodeReaderConfig {
            max_file_bytes: 64,
            ..Default::default()
        });
        let err = reader
            .read(dir.path(), &request("src/driver/clk/clk_core.c", 1, 1))
            .unwrap_err();
        assert!(matches!(err, CodeReadError::FileTooLarge { limit: 64, .. }));
    }

    #[test]
    fn size_limit_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("exact.c"), "a".repeat(64)).unwrap();
        fs::write(dir.path().join("over.c"), "a".repeat(65)).unwrap();
        let reader = CodeContextReader::new(CodeReaderConfig {
            max_file_bytes: 64,
            ..Default::default()
        });

        assert!(reader.read(dir.path(), &request("exact.c", 1, 0)).is_ok());
        let err = reader.read(dir.path(), &request("over.c", 1, 0)).unwrap_err();
        assert!(matches!(err, CodeReadError::FileTooLarge { size: 65, limit: 64, .. }));
    }

    #[test]
    fn strip_prefix_maps_build_paths() {
        let dir = sandbox();
        let reader = CodeContextReader::new(CodeReaderConfig {
            strip_prefix: Some("/home/build/project/".into()),
            ..Default::default()
        });
        let snippet = reader
            .read(
                dir.path(),
                &request("/home/build/project/src/driver/clk/clk_core.c", 10, 0),
            )
            .unwrap();
        assert_eq!(snippet.lines, vec![SnippetLine { number: 10, text: "line 10".into() }]);
    }

    #[test]
    fn normalize_handles_windows_separators() {
        assert_eq!(
            normalize_reference("D:\\build\\src\\clk.c", Some("D:\\build\\")),
            "src/clk.c"
        );
        assert_eq!(normalize_reference("//src/clk.c", None), "src/clk.c");
        assert_eq!(normalize_reference("src/clk.c", Some("")), "src/clk.c");
    }
}
