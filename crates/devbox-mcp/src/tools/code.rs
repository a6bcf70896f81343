//! Code tools over host paths.
//!
//! These walk the filesystem directly; they do not go through a provider.
//! Hidden directories and common build output (`target`, `node_modules`) are
//! skipped, and files that are not valid UTF-8 are ignored.

use super::{parse_params, ToolOutput, ToolRegistry, ToolSpec};
use crate::error::ToolError;
use regex::{Regex, RegexBuilder};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use walkdir::{DirEntry, WalkDir};

const SKIPPED_DIRS: &[&str] = &["target", "node_modules"];
const DEFAULT_MAX_RESULTS: usize = 100;

/// Parameters for `analyze_code`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct AnalyzeCodeParams {
    /// File or directory to analyze.
    pub path: String,
}

/// Parameters for `search_code`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchCodeParams {
    /// File or directory to search.
    pub path: String,

    /// Text to find.
    pub pattern: String,

    /// Treat `pattern` as a regular expression.
    #[serde(default)]
    pub regex: bool,

    /// Ignore case.
    #[serde(default)]
    pub case_insensitive: bool,

    /// Stop after this many matches (default: 100).
    #[serde(default)]
    pub max_results: Option<usize>,
}

/// Parameters for `modify_code`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ModifyCodeParams {
    /// File to edit.
    pub path: String,

    /// Exact text to replace.
    pub search: String,

    /// Replacement text.
    pub replace: String,

    /// Replace every occurrence instead of the first.
    #[serde(default)]
    pub all: bool,
}

/// Line counts for a file or a tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CodeStats {
    pub files: usize,
    pub lines: usize,
    pub blank: usize,
    pub comments: usize,
    pub definitions: usize,
}

impl CodeStats {
    fn add(&mut self, other: &CodeStats) {
        self.files += other.files;
        self.lines += other.lines;
        self.blank += other.blank;
        self.comments += other.comments;
        self.definitions += other.definitions;
    }
}

#[derive(Debug, Serialize)]
struct Analysis {
    path: String,
    #[serde(flatten)]
    totals: CodeStats,
    by_extension: BTreeMap<String, CodeStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchMatch {
    pub file: String,
    pub line: usize,
    pub text: String,
}

#[derive(Debug, Serialize)]
struct SearchResults {
    pattern: String,
    matches: Vec<SearchMatch>,
    truncated: bool,
}

#[derive(Debug, Serialize)]
struct Modification {
    path: String,
    replacements: usize,
}

fn is_definition(line: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"^\s*(export\s+)?(pub(\([^)]*\))?\s+)?(async\s+)?(fn|def|function|class|struct|enum|trait|impl|interface|func)\b",
            )
            .ok()
        })
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(line))
}

fn is_comment(line: &str) -> bool {
    ["//", "#", "/*", "*", "--", "<!--"]
        .iter()
        .any(|prefix| line.starts_with(prefix))
}

/// Count lines in one source text.
pub fn analyze_source(source: &str) -> CodeStats {
    let mut stats = CodeStats {
        files: 1,
        ..Default::default()
    };
    for line in source.lines() {
        stats.lines += 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            stats.blank += 1;
        } else if is_comment(trimmed) {
            stats.comments += 1;
        } else if is_definition(line) {
            stats.definitions += 1;
        }
    }
    stats
}

fn is_skipped(entry: &DirEntry) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref())
}

/// Text files under `root` (or `root` itself if it is a file), in path order.
fn source_files(root: &Path) -> impl Iterator<Item = (PathBuf, String)> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_skipped(entry))
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let contents = std::fs::read_to_string(entry.path()).ok()?;
            Some((entry.into_path(), contents))
        })
}

fn require_path(tool: &str, path: &str) -> Result<PathBuf, ToolError> {
    let path = PathBuf::from(path);
    if !path.exists() {
        return Err(ToolError::invalid(
            tool,
            format!("path does not exist: {}", path.display()),
        ));
    }
    Ok(path)
}

fn analyze(params: AnalyzeCodeParams) -> Result<Analysis, ToolError> {
    let root = require_path("analyze_code", &params.path)?;
    let mut totals = CodeStats::default();
    let mut by_extension: BTreeMap<String, CodeStats> = BTreeMap::new();

    for (path, contents) in source_files(&root) {
        let stats = analyze_source(&contents);
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "(none)".into());
        by_extension.entry(extension).or_default().add(&stats);
        totals.add(&stats);
    }

    Ok(Analysis {
        path: params.path,
        totals,
        by_extension,
    })
}

fn search(params: SearchCodeParams) -> Result<SearchResults, ToolError> {
    if params.pattern.is_empty() {
        return Err(ToolError::invalid("search_code", "pattern must not be empty"));
    }
    let root = require_path("search_code", &params.path)?;
    let source = if params.regex {
        params.pattern.clone()
    } else {
        regex::escape(&params.pattern)
    };
    let matcher = RegexBuilder::new(&source)
        .case_insensitive(params.case_insensitive)
        .build()
        .map_err(|e| ToolError::invalid("search_code", e.to_string()))?;
    let limit = params.max_results.unwrap_or(DEFAULT_MAX_RESULTS);

    let mut matches = Vec::new();
    let mut truncated = false;
    'files: for (path, contents) in source_files(&root) {
        for (index, line) in contents.lines().enumerate() {
            if !matcher.is_match(line) {
                continue;
            }
            if matches.len() >= limit {
                truncated = true;
                break 'files;
            }
            matches.push(SearchMatch {
                file: path.display().to_string(),
                line: index + 1,
                text: line.trim_end().to_string(),
            });
        }
    }

    Ok(SearchResults {
        pattern: params.pattern,
        matches,
        truncated,
    })
}

fn modify(params: ModifyCodeParams) -> Result<Modification, ToolError> {
    if params.search.is_empty() {
        return Err(ToolError::invalid("modify_code", "search must not be empty"));
    }
    let path = require_path("modify_code", &params.path)?;
    let contents = std::fs::read_to_string(&path)
        .map_err(|e| ToolError::Execution(format!("cannot read {}: {e}", path.display())))?;

    let occurrences = contents.matches(params.search.as_str()).count();
    if occurrences == 0 {
        return Err(ToolError::Execution(format!(
            "search text not found in {}",
            path.display()
        )));
    }

    let (updated, replacements) = if params.all {
        (contents.replace(&params.search, &params.replace), occurrences)
    } else {
        (contents.replacen(&params.search, &params.replace, 1), 1)
    };
    std::fs::write(&path, updated)
        .map_err(|e| ToolError::Execution(format!("cannot write {}: {e}", path.display())))?;

    tracing::info!(path = %path.display(), replacements, "File modified");
    Ok(Modification {
        path: params.path,
        replacements,
    })
}

/// Run filesystem work off the async runtime.
async fn blocking<T, F>(f: F) -> Result<ToolOutput, ToolError>
where
    T: Serialize + Send + 'static,
    F: FnOnce() -> Result<T, ToolError> + Send + 'static,
{
    let result = tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ToolError::Execution(format!("code tool task failed: {e}")))??;
    ToolOutput::json(&result)
}

/// The code tools. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeTools;

impl CodeTools {
    pub async fn analyze(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let params: AnalyzeCodeParams = parse_params("analyze_code", params)?;
        blocking(move || analyze(params)).await
    }

    pub async fn search(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let params: SearchCodeParams = parse_params("search_code", params)?;
        blocking(move || search(params)).await
    }

    pub async fn modify(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let params: ModifyCodeParams = parse_params("modify_code", params)?;
        blocking(move || modify(params)).await
    }
}

pub(crate) fn specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new::<AnalyzeCodeParams>(
            "analyze_code",
            "Count lines, blank lines, comments and definitions in a file or directory.",
        ),
        ToolSpec::new::<SearchCodeParams>(
            "search_code",
            "Search files for text or a regular expression.",
        ),
        ToolSpec::new::<ModifyCodeParams>(
            "modify_code",
            "Replace text in a file, once or everywhere.",
        ),
    ]
}

pub(crate) fn register(registry: &mut ToolRegistry, tools: Arc<CodeTools>) {
    for spec in specs() {
        let name = spec.name;
        let tools = Arc::clone(&tools);
        registry.register_fn(spec, move |params| {
            let tools = Arc::clone(&tools);
            async move {
                match name {
                    "analyze_code" => tools.analyze(params).await,
                    "search_code" => tools.search(params).await,
                    "modify_code" => tools.modify(params).await,
                    other => Err(ToolError::UnknownTool(other.to_string())),
                }
            }
        });
    }
}
