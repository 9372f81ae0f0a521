use std::path::{Path, PathBuf};

use tokio::fs;

use duet_types::ChatMessage;

/// Trims to the most recent `limit` entries, evicting oldest first.
pub fn trim_history(history: &mut Vec<ChatMessage>, limit: usize) {
    let limit = limit.max(1);
    if history.len() > limit {
        history.drain(..history.len() - limit);
    }
}

/// JSON-file mirror of the in-memory history, one file per project.
#[derive(Clone)]
pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_for(&self, project: &str) -> PathBuf {
        self.dir
            .join(format!("chat-history-{}.json", sanitize_project_name(project)))
    }

    pub async fn load(&self, project: &str, limit: usize) -> Vec<ChatMessage> {
        let Ok(raw) = fs::read_to_string(self.file_for(project)).await else {
            return Vec::new();
        };
        let mut history =
            serde_json::from_str::<Vec<ChatMessage>>(&raw).unwrap_or_default();
        trim_history(&mut history, limit);
        history
    }

    pub async fn save(
        &self,
        project: &str,
        history: &[ChatMessage],
        limit: usize,
    ) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let keep = limit.max(1).min(history.len());
        let tail = &history[history.len() - keep..];
        let raw = serde_json::to_string_pretty(tail)?;
        fs::write(self.file_for(project), raw).await?;
        Ok(())
    }

    pub async fn clear(&self, project: &str) -> anyhow::Result<()> {
        let path = self.file_for(project);
        if path.exists() {
            fs::remove_file(path).await?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn sanitize_project_name(project: &str) -> String {
    let trimmed = project.trim();
    if trimmed.is_empty() {
        return "global".to_string();
    }
    trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
