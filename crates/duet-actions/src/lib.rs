use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ignore::WalkBuilder;
use regex::Regex;
use tokio::fs;

use duet_wire::extract_scalar;

const EXCLUDED_DIRS: &[&str] = &[
    "bin",
    "target",
    ".settings",
    ".metadata",
    ".git",
    ".idea",
    ".vscode",
    ".gradle",
    ".m2",
    "node_modules",
];

const BINARY_EXTENSIONS: &[&str] = &[
    "class", "jar", "war", "ear", "dll", "exe", "so", "png", "jpg", "jpeg", "gif", "bmp", "ico",
    "pdf", "zip", "gz", "tgz", "xz", "7z", "mp3", "mp4", "mov", "avi", "wav", "ttf", "otf", "woff",
    "woff2", "eot", "pdb", "db", "sqlite", "pack",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionDirective {
    ReadFile {
        project: String,
        path: String,
    },
    ReadFileRange {
        project: String,
        path: String,
        start: Option<u32>,
        end: Option<u32>,
    },
    ReadActiveFile,
    ReadActiveSelection,
    ReadProject,
    ListFiles {
        project: String,
        depth: Option<u32>,
        limit: Option<u32>,
    },
    ListOpenFiles,
    SearchText {
        project: String,
        query: String,
        limit: Option<u32>,
    },
}

impl ActionDirective {
    pub fn kind(&self) -> &'static str {
        match self {
            ActionDirective::ReadFile { .. } => "read_file",
            ActionDirective::ReadFileRange { .. } => "read_file_range",
            ActionDirective::ReadActiveFile => "read_active_file",
            ActionDirective::ReadActiveSelection => "read_active_selection",
            ActionDirective::ReadProject => "read_project",
            ActionDirective::ListFiles { .. } => "list_files",
            ActionDirective::ListOpenFiles => "list_open_files",
            ActionDirective::SearchText { .. } => "search_text",
        }
    }
}

pub struct DirectiveParser {
    read_file_range_json: Regex,
    read_file_range_kv: Regex,
    read_file_json: Regex,
    read_file_kv: Regex,
    read_active_file: Regex,
    read_active_selection: Regex,
    read_project: Regex,
    list_files_json: Regex,
    list_files_kv: Regex,
    list_open_files: Regex,
    search_text_json: Regex,
    search_text_kv: Regex,
}

impl DirectiveParser {
    pub fn new() -> anyhow::Result<Self> {
        let token = r#"([^\s"]+|"[^"]+")"#;
        Ok(Self {
            read_file_range_json: Regex::new(r#"(?i)\[ACTION:READ_FILE_RANGE\]\s*(\{[^}]*\})"#)?,
            read_file_range_kv: Regex::new(&format!(
                r#"(?i)\[ACTION:READ_FILE_RANGE\]\s*project={token}\s+path={token}\s+start=(\d+)\s+end=(\d+)"#
            ))?,
            read_file_json: Regex::new(r#"(?i)\[ACTION:READ_FILE\]\s*(\{[^}]*\})"#)?,
            read_file_kv: Regex::new(&format!(
                r#"(?i)\[ACTION:READ_FILE\]\s*project={token}\s+path={token}"#
            ))?,
            read_active_file: Regex::new(r#"(?i)\[ACTION:READ_ACTIVE_FILE\]"#)?,
            read_active_selection: Regex::new(r#"(?i)\[ACTION:READ_ACTIVE_SELECTION\]"#)?,
            read_project: Regex::new(r#"(?i)\[ACTION:READ_PROJECT\]"#)?,
            list_files_json: Regex::new(r#"(?i)\[ACTION:LIST_FILES\]\s*(\{[^}]*\})"#)?,
            list_files_kv: Regex::new(&format!(
                r#"(?i)\[ACTION:LIST_FILES\]\s*project={token}(?:\s+depth=(\d+))?(?:\s+limit=(\d+))?"#
            ))?,
            list_open_files: Regex::new(r#"(?i)\[ACTION:LIST_OPEN_FILES\]"#)?,
            search_text_json: Regex::new(r#"(?i)\[ACTION:SEARCH_TEXT\]\s*(\{[^}]*\})"#)?,
            search_text_kv: Regex::new(&format!(
                r#"(?i)\[ACTION:SEARCH_TEXT\]\s*project={token}\s+query={token}(?:\s+limit=(\d+))?"#
            ))?,
        })
    }

    /// Directives are tried in a fixed priority order and the first match
    /// wins; the rest of the reply is not re-scanned.
    pub fn parse(&self, text: &str) -> Option<ActionDirective> {
        if text.trim().is_empty() {
            return None;
        }
        self.parse_read_file_range(text)
            .or_else(|| self.parse_read_file(text))
            .or_else(|| self.parse_bare(&self.read_active_file, ActionDirective::ReadActiveFile, text))
            .or_else(|| {
                self.parse_bare(
                    &self.read_active_selection,
                    ActionDirective::ReadActiveSelection,
                    text,
                )
            })
            .or_else(|| self.parse_bare(&self.read_project, ActionDirective::ReadProject, text))
            .or_else(|| self.parse_list_files(text))
            .or_else(|| self.parse_bare(&self.list_open_files, ActionDirective::ListOpenFiles, text))
            .or_else(|| self.parse_search_text(text))
    }

    fn parse_bare(&self, pattern: &Regex, directive: ActionDirective, text: &str) -> Option<ActionDirective> {
        if pattern.is_match(text) {
            Some(directive)
        } else {
            None
        }
    }

    fn parse_read_file_range(&self, text: &str) -> Option<ActionDirective> {
        if let Some(captures) = self.read_file_range_json.captures(text) {
            let object = captures.get(1)?.as_str();
            if let (Some(project), Some(path)) = (
                extract_scalar(object, "project"),
                extract_scalar(object, "path"),
            ) {
                return Some(ActionDirective::ReadFileRange {
                    project,
                    path,
                    start: extract_number(object, "start"),
                    end: extract_number(object, "end"),
                });
            }
        }
        let captures = self.read_file_range_kv.captures(text)?;
        Some(ActionDirective::ReadFileRange {
            project: strip_quotes(captures.get(1)?.as_str()),
            path: strip_quotes(captures.get(2)?.as_str()),
            start: captures.get(3).and_then(|m| m.as_str().parse().ok()),
            end: captures.get(4).and_then(|m| m.as_str().parse().ok()),
        })
    }

    fn parse_read_file(&self, text: &str) -> Option<ActionDirective> {
        if let Some(captures) = self.read_file_json.captures(text) {
            let object = captures.get(1)?.as_str();
            if let (Some(project), Some(path)) = (
                extract_scalar(object, "project"),
                extract_scalar(object, "path"),
            ) {
                return Some(ActionDirective::ReadFile { project, path });
            }
        }
        let captures = self.read_file_kv.captures(text)?;
        Some(ActionDirective::ReadFile {
            project: strip_quotes(captures.get(1)?.as_str()),
            path: strip_quotes(captures.get(2)?.as_str()),
        })
    }

    fn parse_list_files(&self, text: &str) -> Option<ActionDirective> {
        if let Some(captures) = self.list_files_json.captures(text) {
            let object = captures.get(1)?.as_str();
            if let Some(project) = extract_scalar(object, "project") {
                return Some(ActionDirective::ListFiles {
                    project,
                    depth: extract_number(object, "depth"),
                    limit: extract_number(object, "limit"),
                });
            }
        }
        let captures = self.list_files_kv.captures(text)?;
        Some(ActionDirective::ListFiles {
            project: strip_quotes(captures.get(1)?.as_str()),
            depth: captures.get(2).and_then(|m| m.as_str().parse().ok()),
            limit: captures.get(3).and_then(|m| m.as_str().parse().ok()),
        })
    }

    fn parse_search_text(&self, text: &str) -> Option<ActionDirective> {
        if let Some(captures) = self.search_text_json.captures(text) {
            let object = captures.get(1)?.as_str();
            if let (Some(project), Some(query)) = (
                extract_scalar(object, "project"),
                extract_scalar(object, "query"),
            ) {
                return Some(ActionDirective::SearchText {
                    project,
                    query,
                    limit: extract_number(object, "limit"),
                });
            }
        }
        let captures = self.search_text_kv.captures(text)?;
        Some(ActionDirective::SearchText {
            project: strip_quotes(captures.get(1)?.as_str()),
            query: strip_quotes(captures.get(2)?.as_str()),
            limit: captures.get(3).and_then(|m| m.as_str().parse().ok()),
        })
    }
}

fn strip_quotes(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].to_string()
    } else {
        trimmed.to_string()
    }
}

fn extract_number(fragment: &str, key: &str) -> Option<u32> {
    let marker = format!("\"{key}\"");
    let rest = &fragment[fragment.find(&marker)? + marker.len()..];
    let rest = rest.trim_start().strip_prefix(':')?.trim_start();
    let rest = rest.strip_prefix('"').unwrap_or(rest);
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[derive(Debug, Clone, Copy)]
pub struct ActionLimits {
    pub max_depth: u32,
    pub max_limit: u32,
}

impl Default for ActionLimits {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_limit: 1000,
        }
    }
}

#[async_trait]
pub trait Workspace: Send + Sync {
    async fn read_file(&self, project: &str, path: &str) -> String;
    async fn read_file_range(&self, project: &str, path: &str, start: u32, end: u32) -> String;
    async fn list_project_tree(&self, project: &str, depth: u32, limit: u32) -> String;
    async fn search_text(&self, project: &str, query: &str, limit: u32) -> String;
    async fn list_open_files(&self) -> String;
    async fn active_editor_content(&self) -> String;
    async fn active_file_name(&self) -> String;
    async fn active_file_extension(&self) -> String;
    async fn active_selection_text(&self) -> String;
    async fn active_project_name(&self) -> String;
    async fn read_workspace_snapshot(&self) -> String;
}

pub struct ActionDispatcher {
    workspace: Arc<dyn Workspace>,
    parser: DirectiveParser,
    limits: ActionLimits,
}

impl ActionDispatcher {
    pub fn new(workspace: Arc<dyn Workspace>, limits: ActionLimits) -> anyhow::Result<Self> {
        Ok(Self {
            workspace,
            parser: DirectiveParser::new()?,
            limits,
        })
    }

    /// Scans a completed assistant reply for at most one directive and
    /// returns the framed follow-up message to feed back into the chat.
    pub async fn run(&self, assistant_reply: &str) -> Option<String> {
        let directive = self.parser.parse(assistant_reply)?;
        tracing::debug!(directive = directive.kind(), "matched action directive");
        Some(self.execute(directive).await)
    }

    pub async fn execute(&self, directive: ActionDirective) -> String {
        match directive {
            ActionDirective::ReadFile { project, path } => {
                let content = self.workspace.read_file(&project, &path).await;
                if content.trim().is_empty() {
                    format!("[SYSTEM] File not found or empty: {path}")
                } else {
                    format!("Requested content:\n{content}")
                }
            }
            ActionDirective::ReadFileRange {
                project,
                path,
                start,
                end,
            } => {
                let start = start.unwrap_or(1);
                let end = end.unwrap_or(start.saturating_add(200));
                let content = self
                    .workspace
                    .read_file_range(&project, &path, start, end)
                    .await;
                if content.trim().is_empty() {
                    format!("[SYSTEM] Empty range or file not found: {path}")
                } else {
                    format!("Requested content ({start}-{end}):\n{content}")
                }
            }
            ActionDirective::ReadActiveFile => {
                let content = self.workspace.active_editor_content().await;
                if content.trim().is_empty() {
                    "[SYSTEM] No active editor or it is empty".to_string()
                } else {
                    format!("Active file:\n{content}")
                }
            }
            ActionDirective::ReadActiveSelection => {
                let selection = self.workspace.active_selection_text().await;
                if selection.trim().is_empty() {
                    "[SYSTEM] No active selection".to_string()
                } else {
                    format!("Active selection:\n{selection}")
                }
            }
            ActionDirective::ReadProject => {
                format!(
                    "Project snapshot:\n{}",
                    self.workspace.read_workspace_snapshot().await
                )
            }
            ActionDirective::ListFiles {
                project,
                depth,
                limit,
            } => {
                let depth = depth.unwrap_or(2).min(self.max_depth_bound());
                let limit = limit.unwrap_or(200).min(self.max_limit_bound());
                format!(
                    "File listing:\n{}",
                    self.workspace.list_project_tree(&project, depth, limit).await
                )
            }
            ActionDirective::ListOpenFiles => {
                format!("Open files:\n{}", self.workspace.list_open_files().await)
            }
            ActionDirective::SearchText {
                project,
                query,
                limit,
            } => {
                let limit = limit.unwrap_or(50).min(self.max_limit_bound());
                format!(
                    "Search results:\n{}",
                    self.workspace.search_text(&project, &query, limit).await
                )
            }
        }
    }

    fn max_depth_bound(&self) -> u32 {
        self.limits.max_depth.clamp(1, 10)
    }

    fn max_limit_bound(&self) -> u32 {
        self.limits.max_limit.clamp(10, 1000)
    }
}

pub struct LocalWorkspace {
    root: PathBuf,
    active_project: Option<String>,
}

impl LocalWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            active_project: None,
        }
    }

    pub fn with_active_project(mut self, project: impl Into<String>) -> Self {
        self.active_project = Some(project.into());
        self
    }

    fn project_dir(&self, project: &str) -> Option<PathBuf> {
        if project.trim().is_empty() || !is_relative_path(project) {
            return None;
        }
        let dir = self.root.join(project);
        if dir.is_dir() {
            Some(dir)
        } else {
            None
        }
    }
}

fn is_relative_path(path: &str) -> bool {
    let raw = Path::new(path);
    if raw.is_absolute() {
        return false;
    }
    !raw.components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
}

fn is_excluded_name(name: &std::ffi::OsStr) -> bool {
    name.to_str()
        .map(|n| EXCLUDED_DIRS.contains(&n))
        .unwrap_or(false)
}

fn is_binary_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| BINARY_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn project_walker(dir: &Path, max_depth: Option<u32>) -> ignore::Walk {
    let mut builder = WalkBuilder::new(dir);
    builder
        .max_depth(max_depth.map(|d| d as usize))
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(|entry| !is_excluded_name(entry.file_name()));
    builder.build()
}

#[async_trait]
impl Workspace for LocalWorkspace {
    async fn read_file(&self, project: &str, path: &str) -> String {
        let Some(dir) = self.project_dir(project) else {
            return String::new();
        };
        if !is_relative_path(path) {
            return String::new();
        }
        fs::read_to_string(dir.join(path)).await.unwrap_or_default()
    }

    // Lines are 1-based and inclusive; out-of-range bounds are pulled back
    // into the file instead of failing.
    async fn read_file_range(&self, project: &str, path: &str, start: u32, end: u32) -> String {
        let content = self.read_file(project, path).await;
        if content.trim().is_empty() {
            return String::new();
        }
        let lines: Vec<&str> = content.lines().collect();
        let len = lines.len() as u32;
        let from = start.min(len).max(1);
        let to = end.min(len).max(from);
        lines[(from - 1) as usize..=(to - 1) as usize].join("\n")
    }

    async fn list_project_tree(&self, project: &str, depth: u32, limit: u32) -> String {
        let Some(dir) = self.project_dir(project) else {
            return "[Project not found]".to_string();
        };
        let mut remaining = limit.max(1);
        let mut out = format!("Project {project}\n");
        for entry in project_walker(&dir, Some(depth.max(1))).flatten() {
            let entry_depth = entry.depth();
            if entry_depth == 0 {
                continue;
            }
            let indent = "  ".repeat(entry_depth - 1);
            if remaining == 0 {
                out.push_str(&indent);
                out.push_str("... (limit reached)\n");
                break;
            }
            out.push_str(&indent);
            out.push_str(&entry.file_name().to_string_lossy());
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                out.push('/');
            }
            out.push('\n');
            remaining -= 1;
        }
        out
    }

    // One hit per file: the path and the first matching line number.
    async fn search_text(&self, project: &str, query: &str, limit: u32) -> String {
        if query.trim().is_empty() {
            return "[Empty search term]".to_string();
        }
        let Some(dir) = self.project_dir(project) else {
            return "[Project not found]".to_string();
        };
        let needle = query.to_lowercase();
        let mut remaining = limit.max(1);
        let mut out = String::new();
        for entry in project_walker(&dir, None).flatten() {
            if remaining == 0 {
                break;
            }
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let path = entry.path();
            if is_binary_extension(path) {
                continue;
            }
            let Ok(content) = fs::read_to_string(path).await else {
                continue;
            };
            let hit = content
                .lines()
                .enumerate()
                .find(|(_, line)| line.to_lowercase().contains(&needle));
            if let Some((idx, _)) = hit {
                let rel = path.strip_prefix(&dir).unwrap_or(path);
                out.push_str(&format!("{}:{}\n", rel.display(), idx + 1));
                remaining -= 1;
            }
        }
        if out.is_empty() {
            "[No matches]".to_string()
        } else {
            out
        }
    }

    async fn list_open_files(&self) -> String {
        "[No open editors]".to_string()
    }

    async fn active_editor_content(&self) -> String {
        String::new()
    }

    async fn active_file_name(&self) -> String {
        String::new()
    }

    async fn active_file_extension(&self) -> String {
        String::new()
    }

    async fn active_selection_text(&self) -> String {
        String::new()
    }

    async fn active_project_name(&self) -> String {
        self.active_project.clone().unwrap_or_default()
    }

    async fn read_workspace_snapshot(&self) -> String {
        let mut projects: Vec<(String, PathBuf)> = Vec::new();
        if let Ok(mut entries) = fs::read_dir(&self.root).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') || is_excluded_name(entry.file_name().as_os_str()) {
                    continue;
                }
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    projects.push((name, entry.path()));
                }
            }
        }
        projects.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = String::new();
        for (name, dir) in projects {
            out.push_str(&format!("\n=== Project: {name} ===\n"));
            for entry in project_walker(&dir, None).flatten() {
                if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    continue;
                }
                let path = entry.path();
                if is_binary_extension(path) {
                    continue;
                }
                let rel = path.strip_prefix(&dir).unwrap_or(path);
                out.push_str(&format!("\nFile: {}\n", rel.display()));
                match fs::read_to_string(path).await {
                    Ok(content) => out.push_str(&content),
                    Err(_) => out.push_str("[Error reading file]\n"),
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct RecordingWorkspace {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingWorkspace {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn record(&self, call: String) {
            self.calls.lock().expect("calls lock").push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl Workspace for RecordingWorkspace {
        async fn read_file(&self, project: &str, path: &str) -> String {
            self.record(format!("read_file {project} {path}"));
            "file body".to_string()
        }
        async fn read_file_range(&self, project: &str, path: &str, start: u32, end: u32) -> String {
            self.record(format!("read_file_range {project} {path} {start} {end}"));
            "range body".to_string()
        }
        async fn list_project_tree(&self, project: &str, depth: u32, limit: u32) -> String {
            self.record(format!("list_project_tree {project} {depth} {limit}"));
            "tree".to_string()
        }
        async fn search_text(&self, project: &str, query: &str, limit: u32) -> String {
            self.record(format!("search_text {project} {query} {limit}"));
            "hits".to_string()
        }
        async fn list_open_files(&self) -> String {
            self.record("list_open_files".to_string());
            "Main.rs (src/Main.rs)".to_string()
        }
        async fn active_editor_content(&self) -> String {
            self.record("active_editor_content".to_string());
            String::new()
        }
        async fn active_file_name(&self) -> String {
            String::new()
        }
        async fn active_file_extension(&self) -> String {
            String::new()
        }
        async fn active_selection_text(&self) -> String {
            String::new()
        }
        async fn active_project_name(&self) -> String {
            String::new()
        }
        async fn read_workspace_snapshot(&self) -> String {
            self.record("read_workspace_snapshot".to_string());
            "snapshot".to_string()
        }
    }

    fn parser() -> DirectiveParser {
        DirectiveParser::new().expect("parser")
    }

    fn dispatcher(workspace: Arc<RecordingWorkspace>) -> ActionDispatcher {
        ActionDispatcher::new(workspace, ActionLimits::default()).expect("dispatcher")
    }

    #[test]
    fn kv_and_json_forms_parse_identically() {
        let parser = parser();
        let kv = parser.parse("[ACTION:READ_FILE] project=foo path=bar.txt");
        let json = parser.parse(r#"[ACTION:READ_FILE]{"project":"foo","path":"bar.txt"}"#);
        assert_eq!(
            kv,
            Some(ActionDirective::ReadFile {
                project: "foo".to_string(),
                path: "bar.txt".to_string(),
            })
        );
        assert_eq!(kv, json);
    }

    #[test]
    fn quoted_params_keep_spaces() {
        let parsed = parser().parse(r#"[ACTION:READ_FILE] project="my proj" path="src/some file.txt""#);
        assert_eq!(
            parsed,
            Some(ActionDirective::ReadFile {
                project: "my proj".to_string(),
                path: "src/some file.txt".to_string(),
            })
        );
    }

    #[test]
    fn range_directive_is_not_mistaken_for_read_file() {
        let parsed =
            parser().parse("[ACTION:READ_FILE_RANGE] project=foo path=bar.txt start=3 end=9");
        assert_eq!(
            parsed,
            Some(ActionDirective::ReadFileRange {
                project: "foo".to_string(),
                path: "bar.txt".to_string(),
                start: Some(3),
                end: Some(9),
            })
        );
    }

    #[test]
    fn range_json_form_reads_numeric_fields() {
        let parsed = parser().parse(
            r#"[ACTION:READ_FILE_RANGE]{"project":"foo","path":"bar.txt","start":10,"end":20}"#,
        );
        assert_eq!(
            parsed,
            Some(ActionDirective::ReadFileRange {
                project: "foo".to_string(),
                path: "bar.txt".to_string(),
                start: Some(10),
                end: Some(20),
            })
        );
    }

    #[test]
    fn prose_without_directives_parses_to_none() {
        let parser = parser();
        assert_eq!(parser.parse("just a normal reply about code"), None);
        assert_eq!(parser.parse("[ACTION:DO_SOMETHING_ELSE] project=x"), None);
        assert_eq!(parser.parse("   "), None);
    }

    #[test]
    fn priority_order_beats_text_order() {
        let reply = "[ACTION:SEARCH_TEXT] project=foo query=main\n[ACTION:LIST_OPEN_FILES]";
        assert_eq!(parser().parse(reply), Some(ActionDirective::ListOpenFiles));
    }

    #[tokio::test]
    async fn equivalent_forms_dispatch_the_same_workspace_call() {
        for reply in [
            "[ACTION:READ_FILE] project=foo path=bar.txt",
            r#"[ACTION:READ_FILE]{"project":"foo","path":"bar.txt"}"#,
        ] {
            let workspace = RecordingWorkspace::new();
            let out = dispatcher(workspace.clone()).run(reply).await;
            assert_eq!(out.as_deref(), Some("Requested content:\nfile body"));
            assert_eq!(workspace.calls(), vec!["read_file foo bar.txt".to_string()]);
        }
    }

    #[tokio::test]
    async fn only_first_directive_in_reply_is_serviced() {
        let workspace = RecordingWorkspace::new();
        let reply = "[ACTION:LIST_OPEN_FILES]\nand then\n[ACTION:SEARCH_TEXT] project=foo query=bar";
        let out = dispatcher(workspace.clone()).run(reply).await;
        assert_eq!(
            out.as_deref(),
            Some("Open files:\nMain.rs (src/Main.rs)")
        );
        assert_eq!(workspace.calls(), vec!["list_open_files".to_string()]);
    }

    #[tokio::test]
    async fn list_files_applies_defaults_and_bounds() {
        let workspace = RecordingWorkspace::new();
        let dispatcher = dispatcher(workspace.clone());
        dispatcher
            .run("[ACTION:LIST_FILES] project=foo")
            .await
            .expect("dispatched");
        dispatcher
            .run("[ACTION:LIST_FILES] project=foo depth=99 limit=99999")
            .await
            .expect("dispatched");
        assert_eq!(
            workspace.calls(),
            vec![
                "list_project_tree foo 2 200".to_string(),
                "list_project_tree foo 10 1000".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn search_text_limit_defaults_to_fifty() {
        let workspace = RecordingWorkspace::new();
        dispatcher(workspace.clone())
            .run("[ACTION:SEARCH_TEXT] project=foo query=needle")
            .await
            .expect("dispatched");
        assert_eq!(workspace.calls(), vec!["search_text foo needle 50".to_string()]);
    }

    #[tokio::test]
    async fn empty_active_editor_yields_system_placeholder() {
        let workspace = RecordingWorkspace::new();
        let out = dispatcher(workspace.clone())
            .run("[ACTION:READ_ACTIVE_FILE]")
            .await;
        assert_eq!(
            out.as_deref(),
            Some("[SYSTEM] No active editor or it is empty")
        );
    }

    async fn sample_workspace() -> (TempDir, LocalWorkspace) {
        let dir = TempDir::new().expect("tempdir");
        let project = dir.path().join("demo");
        fs::create_dir_all(project.join("src")).await.expect("mkdir");
        fs::write(project.join("README.md"), "hello duet\nsecond line\nthird line\n")
            .await
            .expect("write");
        fs::write(project.join("src/main.rs"), "fn main() {\n    println!(\"hi\");\n}\n")
            .await
            .expect("write");
        let workspace = LocalWorkspace::new(dir.path());
        (dir, workspace)
    }

    #[tokio::test]
    async fn local_workspace_reads_project_files() {
        let (_dir, workspace) = sample_workspace().await;
        let content = workspace.read_file("demo", "README.md").await;
        assert!(content.starts_with("hello duet"));
        assert_eq!(workspace.read_file("demo", "missing.txt").await, "");
        assert_eq!(workspace.read_file("nope", "README.md").await, "");
    }

    #[tokio::test]
    async fn local_workspace_rejects_parent_traversal() {
        let (_dir, workspace) = sample_workspace().await;
        assert_eq!(workspace.read_file("demo", "../demo/README.md").await, "");
        assert_eq!(workspace.read_file("../demo", "README.md").await, "");
    }

    #[tokio::test]
    async fn local_workspace_reads_line_ranges_inclusively() {
        let (_dir, workspace) = sample_workspace().await;
        let slice = workspace.read_file_range("demo", "README.md", 2, 3).await;
        assert_eq!(slice, "second line\nthird line");
        let clamped = workspace.read_file_range("demo", "README.md", 2, 99).await;
        assert_eq!(clamped, "second line\nthird line");
    }

    #[tokio::test]
    async fn local_workspace_tree_marks_directories_and_limit() {
        let (_dir, workspace) = sample_workspace().await;
        let tree = workspace.list_project_tree("demo", 3, 100).await;
        assert!(tree.starts_with("Project demo\n"));
        assert!(tree.contains("src/"));
        assert!(tree.contains("main.rs"));

        let truncated = workspace.list_project_tree("demo", 3, 1).await;
        assert!(truncated.contains("... (limit reached)"));
    }

    #[tokio::test]
    async fn local_workspace_search_reports_first_matching_line() {
        let (_dir, workspace) = sample_workspace().await;
        let hits = workspace.search_text("demo", "SECOND", 10).await;
        assert_eq!(hits, "README.md:2\n");
        assert_eq!(workspace.search_text("demo", "absent-term", 10).await, "[No matches]");
        assert_eq!(workspace.search_text("demo", "  ", 10).await, "[Empty search term]");
    }

    #[tokio::test]
    async fn local_workspace_snapshot_lists_projects_and_files() {
        let (_dir, workspace) = sample_workspace().await;
        let snapshot = workspace.read_workspace_snapshot().await;
        assert!(snapshot.contains("=== Project: demo ==="));
        assert!(snapshot.contains("File: README.md"));
        assert!(snapshot.contains("hello duet"));
    }
}
