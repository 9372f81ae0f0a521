use std::sync::Arc;

use duet_actions::Workspace;
use duet_types::ChatMessage;

/// Upper bound on the prompt context sent to a provider, in characters.
pub const MAX_CONTEXT_CHARS: usize = 6000;

const TEMPLATE_HEAD: &str = "CHAT HISTORY:\n";

const TEMPLATE_INSTRUCTIONS: &str = r#"INSTRUCTIONS:
You are Duet Chat inside the user's editor. Use only user-provided or workspace-provided information, and only when the user asks for it. To request more context you have special actions that must appear alone on their own line (no bullets, no extra text):

Action syntax (choose one): plain params, quoted params, or JSON on the same line:
- [ACTION:READ_FILE] project=duet path=crates/duet-core/src/engine.rs
- [ACTION:READ_FILE] project="duet" path="crates/duet-core/src/engine.rs"
- [ACTION:READ_FILE]{"project":"duet","path":"crates/duet-core/src/engine.rs"}

1) [ACTION:READ_FILE] project=<projectName> path=<project/relative/path>
- Use only when you need the full contents of an existing file.
- `project` must exactly match the workspace project name.
- `path` is relative to that project root.

1b) [ACTION:READ_FILE_RANGE] project=<projectName> path=<path> start=<line> end=<line>
- Use when you only need a slice of a file (1-based, inclusive).

1c) [ACTION:READ_ACTIVE_FILE]
- Returns the current editor contents (includes unsaved changes).

1d) [ACTION:READ_ACTIVE_SELECTION]
- Returns only the current text selection in the active editor.

2) [ACTION:READ_PROJECT]
- Requests a summarized workspace snapshot (projects list, relevant directory trees, and open files).
- Use only when you truly need a global view before asking for specifics.

3) [ACTION:LIST_FILES] project=<projectName> depth=<n?> limit=<m?>
- Retrieves only the folder/file structure for the given project.
- `depth` and `limit` are optional (defaults: depth=2, limit=200) to avoid huge responses.

4) [ACTION:LIST_OPEN_FILES]
- Returns names and project-relative paths of currently open editors.

5) [ACTION:SEARCH_TEXT] project=<projectName> query=<text> limit=<n?>
- Case-insensitive search; returns file paths (and first matching line) up to a safe limit (default 50).

Rules:
- Ask for only one action per message; wait for the system to reply with that content before continuing.
- If you lack needed information, say what is missing and propose the single best action instead of inventing details.
- Never assume you have seen a file unless you requested it in this conversation.
- After receiving requested info, incorporate it; do not repeat the action unless there is a new, clear reason.
- Response language: detect the user's language from recent messages. If you can respond in that language, do so; otherwise, respond in English.
- Formatting: when you show code or file contents, use ONE Markdown fenced code block with real newlines (no literal "\n" sequences); do not escape content, and avoid preambles like "Here is the code".
- Use a language tag on the fence (e.g., ```rust). Do NOT wrap the fence itself in backticks. Do NOT use inline single backticks for multi-line code. Preserve backslashes and quotes exactly as in the source so they render and highlight correctly.
- Do not invent actions or parameters beyond the list above; if a desired action is missing, ask for clarification instead of creating a new tag.
End of context.
"#;

/// Assembles the instructional prompt context from the chat history and the
/// workspace's active-editor state.
#[derive(Clone)]
pub struct ContextBuilder {
    workspace: Arc<dyn Workspace>,
}

impl ContextBuilder {
    pub fn new(workspace: Arc<dyn Workspace>) -> Self {
        Self { workspace }
    }

    pub async fn build(&self, history: &[ChatMessage]) -> String {
        let active_file = self.workspace.active_file_name().await;
        let language = self.workspace.active_file_extension().await;
        let code = self.workspace.active_editor_content().await;

        let mut out = String::new();
        out.push_str(TEMPLATE_HEAD);
        out.push_str(&format_history(history));
        out.push('\n');
        out.push_str(&format!("Active file: {active_file}\n"));
        out.push_str(&format!("Language: {language}\n\n"));
        out.push_str(&format!("Code:\n{code}\n\n"));
        out.push_str(TEMPLATE_INSTRUCTIONS);
        out
    }
}

fn format_history(history: &[ChatMessage]) -> String {
    let mut out = String::new();
    for message in history {
        out.push_str(&message.role.as_str().to_uppercase());
        out.push_str(":\n");
        out.push_str(&message.content);
        out.push_str("\n\n");
    }
    out
}

/// Keeps the most recent tail of the context when it exceeds the cap. The
/// instructional template sits at the end, so the suffix is the part worth
/// preserving.
pub fn limit_context(context: &str) -> String {
    let chars: Vec<char> = context.chars().collect();
    if chars.len() <= MAX_CONTEXT_CHARS {
        return context.to_string();
    }
    chars[chars.len() - MAX_CONTEXT_CHARS..].iter().collect()
}

/// Scrubs text for providers that only accept plain ASCII. Normalizes line
/// endings, drops control characters other than newline and tab, and drops
/// any non-ASCII character outright.
pub fn sanitize_for_local(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let scrubbed: String = normalized
        .chars()
        .filter(|&c| {
            if c == '\n' || c == '\t' {
                return true;
            }
            c.is_ascii() && !c.is_control()
        })
        .collect();
    scrubbed.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use duet_types::ChatMessage;

    struct FakeWorkspace;

    #[async_trait]
    impl Workspace for FakeWorkspace {
        async fn read_file(&self, _project: &str, _path: &str) -> String {
            String::new()
        }
        async fn read_file_range(
            &self,
            _project: &str,
            _path: &str,
            _start: u32,
            _end: u32,
        ) -> String {
            String::new()
        }
        async fn list_project_tree(&self, _project: &str, _depth: u32, _limit: u32) -> String {
            String::new()
        }
        async fn search_text(&self, _project: &str, _query: &str, _limit: u32) -> String {
            String::new()
        }
        async fn list_open_files(&self) -> String {
            String::new()
        }
        async fn active_editor_content(&self) -> String {
            "fn main() {}".to_string()
        }
        async fn active_file_name(&self) -> String {
            "main.rs".to_string()
        }
        async fn active_file_extension(&self) -> String {
            "rs".to_string()
        }
        async fn active_selection_text(&self) -> String {
            String::new()
        }
        async fn active_project_name(&self) -> String {
            "demo".to_string()
        }
        async fn read_workspace_snapshot(&self) -> String {
            String::new()
        }
    }

    #[tokio::test]
    async fn build_includes_history_editor_and_instructions() {
        let builder = ContextBuilder::new(Arc::new(FakeWorkspace));
        let history = vec![
            ChatMessage::user("hello"),
            ChatMessage::assistant("hi there"),
        ];
        let context = builder.build(&history).await;

        assert!(context.starts_with("CHAT HISTORY:\n"));
        assert!(context.contains("USER:\nhello\n\n"));
        assert!(context.contains("ASSISTANT:\nhi there\n\n"));
        assert!(context.contains("Active file: main.rs\n"));
        assert!(context.contains("Language: rs\n"));
        assert!(context.contains("Code:\nfn main() {}\n"));
        assert!(context.contains("[ACTION:READ_FILE]"));
        assert!(context.trim_end().ends_with("End of context."));
    }

    #[test]
    fn limit_context_keeps_the_suffix() {
        let long = "a".repeat(MAX_CONTEXT_CHARS) + "TAIL";
        let limited = limit_context(&long);
        assert_eq!(limited.chars().count(), MAX_CONTEXT_CHARS);
        assert!(limited.ends_with("TAIL"));

        let short = "short context";
        assert_eq!(limit_context(short), short);
    }

    #[test]
    fn sanitize_normalizes_newlines_and_drops_non_ascii() {
        let input = "line one\r\nline two\rcafé ✓\t end\u{0007}  ";
        let sanitized = sanitize_for_local(input);
        assert_eq!(sanitized, "line one\nline two\ncaf \t end");
    }

    #[test]
    fn sanitize_can_leave_nothing() {
        assert_eq!(sanitize_for_local("日本語のみ"), "");
    }
}
