use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use duet_actions::LocalWorkspace;
use duet_core::{ChatEngine, ConfigStore, EventBus, HistoryStore};
use duet_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent,
    ProcessKind, WorkerGuard,
};
use duet_providers::ProviderRegistry;
use tokio::io::AsyncBufReadExt;
use tracing::info;

const SUPPORTED_PROVIDER_IDS: [&str; 5] = ["openai", "qwen", "deepseek", "gemini", "ollama"];

#[derive(Parser, Debug)]
#[command(name = "duet-engine")]
#[command(about = "Headless Duet chat backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one prompt and print the final reply.
    Run {
        prompt: String,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        workspace: Option<String>,
    },
    /// Interactive chat session on stdin.
    Chat {
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        workspace: Option<String>,
    },
    /// List configured providers, or the model catalog of one provider.
    Models {
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        state_dir: Option<String>,
    },
}

struct Runtime {
    engine: ChatEngine,
    event_bus: EventBus,
    providers: ProviderRegistry,
    // Keeps the non-blocking log writer alive for the process lifetime.
    _log_guard: WorkerGuard,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            prompt,
            api_key,
            provider,
            model,
            config,
            state_dir,
            workspace,
        } => {
            let provider = normalize_and_validate_provider(provider)?;
            let overrides = build_cli_overrides(api_key, provider, model)?;
            let state_dir = resolve_state_dir(state_dir);
            let runtime =
                build_runtime(&state_dir, workspace, overrides, config.map(PathBuf::from)).await?;
            send_and_print(&runtime.engine, &runtime.event_bus, &prompt).await;
        }
        Command::Chat {
            api_key,
            provider,
            model,
            config,
            state_dir,
            workspace,
        } => {
            let provider = normalize_and_validate_provider(provider)?;
            let overrides = build_cli_overrides(api_key, provider, model)?;
            let state_dir = resolve_state_dir(state_dir);
            let runtime =
                build_runtime(&state_dir, workspace, overrides, config.map(PathBuf::from)).await?;
            run_chat(runtime).await?;
        }
        Command::Models {
            provider,
            config,
            state_dir,
        } => {
            let provider = normalize_and_validate_provider(provider)?;
            let state_dir = resolve_state_dir(state_dir);
            let runtime = build_runtime(&state_dir, None, None, config.map(PathBuf::from)).await?;
            match provider {
                Some(id) => {
                    let selected = runtime.providers.select(Some(&id)).await?;
                    for model in selected.list_models().await {
                        println!("{model}");
                    }
                }
                None => {
                    for info in runtime.providers.list().await {
                        let key = if info.requires_api_key {
                            "api key required"
                        } else {
                            "no api key"
                        };
                        println!("{}\t{}\t({key})", info.id, info.name);
                    }
                }
            }
        }
    }

    Ok(())
}

async fn build_runtime(
    state_dir: &Path,
    workspace: Option<String>,
    cli_overrides: Option<serde_json::Value>,
    override_config_path: Option<PathBuf>,
) -> anyhow::Result<Runtime> {
    let config_path = override_config_path.unwrap_or_else(|| state_dir.join("config.json"));
    let config_store = ConfigStore::new(config_path, cli_overrides).await?;
    let config = config_store.get().await;

    let logs_dir = canonical_logs_dir_from_root(state_dir);
    let (log_guard, log_info) =
        init_process_logging(ProcessKind::Engine, &logs_dir, config.logs.retention_days)?;
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent {
            event: "logging.initialized",
            component: "engine.main",
            correlation_id: None,
            session_id: None,
            chain_id: None,
            provider_id: None,
            model_id: None,
            status: Some("ok"),
            error_code: None,
            detail: Some("engine jsonl logging initialized"),
        },
    );
    info!("engine logging initialized: {:?}", log_info);

    let workspace_root = workspace
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    let project = project_name_for(&workspace_root);
    let workspace = Arc::new(
        LocalWorkspace::new(workspace_root).with_active_project(project.clone()),
    );

    let providers = ProviderRegistry::new(config.clone().into());
    let event_bus = EventBus::new();
    let engine = ChatEngine::new(
        &config,
        providers.clone(),
        workspace,
        HistoryStore::new(state_dir.join("history")),
        event_bus.clone(),
        project,
    )
    .await?;

    Ok(Runtime {
        engine,
        event_bus,
        providers,
        _log_guard: log_guard,
    })
}

async fn run_chat(runtime: Runtime) -> anyhow::Result<()> {
    let info = runtime.engine.current_provider().await;
    println!("duet chat ({}). /provider <id>, /model <name>, /models, /quit", info.id);

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, char::is_whitespace);
        let head = parts.next().unwrap_or_default();
        let tail = parts.next().unwrap_or_default().trim();
        match head {
            "/quit" | "/exit" => break,
            "/provider" => {
                if tail.is_empty() {
                    eprintln!("usage: /provider <{}>", SUPPORTED_PROVIDER_IDS.join("|"));
                    continue;
                }
                match runtime.engine.switch_provider(tail).await {
                    Ok(info) => println!("provider: {} ({})", info.id, info.name),
                    Err(err) => eprintln!("error: {err:#}"),
                }
            }
            "/model" => {
                if tail.is_empty() {
                    eprintln!("usage: /model <name>");
                    continue;
                }
                runtime.engine.set_model(tail).await;
                println!("model: {tail}");
            }
            "/models" => {
                for model in runtime.engine.list_models().await {
                    println!("{model}");
                }
            }
            _ => send_and_print(&runtime.engine, &runtime.event_bus, &line).await,
        }
    }
    Ok(())
}

/// Streams assistant deltas to stdout as they arrive; replies that were not
/// streamed (shorthand output) are printed whole afterwards.
async fn send_and_print(engine: &ChatEngine, bus: &EventBus, text: &str) {
    let mut events = bus.subscribe();
    let streamed = Arc::new(AtomicBool::new(false));
    let streamed_flag = streamed.clone();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event.event_type.as_str() {
                "message.delta" => {
                    if let Some(delta) = event.properties["delta"].as_str() {
                        streamed_flag.store(true, Ordering::SeqCst);
                        print!("{delta}");
                        let _ = std::io::stdout().flush();
                    }
                }
                "stream.error" => {
                    if let Some(error) = event.properties["error"].as_str() {
                        eprintln!("\nerror: {error}");
                    }
                }
                _ => {}
            }
        }
    });

    let result = engine.send(text).await;
    printer.abort();
    match result {
        Ok(reply) => {
            if streamed.load(Ordering::SeqCst) {
                println!();
            } else if !reply.is_empty() {
                println!("{reply}");
            }
        }
        Err(err) => eprintln!("error: {err:#}"),
    }
}

fn build_cli_overrides(
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
) -> anyhow::Result<Option<serde_json::Value>> {
    let provider = normalize_and_validate_provider(provider)?;

    if api_key.is_none() && provider.is_none() && model.is_none() {
        return Ok(None);
    }
    let mut root = serde_json::Map::new();

    if let Some(p) = &provider {
        root.insert(
            "default_provider".to_string(),
            serde_json::Value::String(p.clone()),
        );
    }

    // api_key/model overrides target the selected provider, openai otherwise.
    let target_provider = provider.as_deref().unwrap_or("openai");

    if api_key.is_some() || model.is_some() {
        let mut provider_config = serde_json::Map::new();
        if let Some(k) = api_key {
            provider_config.insert("api_key".to_string(), serde_json::Value::String(k));
        }
        if let Some(m) = model {
            provider_config.insert("default_model".to_string(), serde_json::Value::String(m));
        }

        let mut providers = serde_json::Map::new();
        providers.insert(
            target_provider.to_string(),
            serde_json::Value::Object(provider_config),
        );
        root.insert(
            "providers".to_string(),
            serde_json::Value::Object(providers),
        );
    }

    Ok(Some(serde_json::Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("DUET_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".duet"))
        .unwrap_or_else(|| PathBuf::from(".duet"))
}

fn project_name_for(workspace_root: &Path) -> String {
    workspace_root
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_cli_overrides_targets_selected_provider() {
        let overrides = build_cli_overrides(
            Some("sk-test".to_string()),
            Some("qwen".to_string()),
            Some("qwen-max".to_string()),
        )
        .expect("overrides")
        .expect("some");

        assert_eq!(overrides["default_provider"], "qwen");
        assert_eq!(overrides["providers"]["qwen"]["api_key"], json!("sk-test"));
        assert_eq!(
            overrides["providers"]["qwen"]["default_model"],
            json!("qwen-max")
        );
    }

    #[test]
    fn build_cli_overrides_defaults_model_and_key_to_openai_without_provider() {
        let overrides = build_cli_overrides(
            Some("sk-test".to_string()),
            None,
            Some("gpt-4o-mini".to_string()),
        )
        .expect("overrides")
        .expect("some");

        assert!(overrides.get("default_provider").is_none());
        assert_eq!(
            overrides["providers"]["openai"]["api_key"],
            json!("sk-test")
        );
        assert_eq!(
            overrides["providers"]["openai"]["default_model"],
            json!("gpt-4o-mini")
        );
    }

    #[test]
    fn normalize_and_validate_provider_accepts_known_values_case_insensitive() {
        let provider =
            normalize_and_validate_provider(Some(" Gemini ".to_string())).expect("provider");
        assert_eq!(provider.as_deref(), Some("gemini"));
    }

    #[test]
    fn normalize_and_validate_provider_rejects_unknown_value() {
        let err = normalize_and_validate_provider(Some("geminy".to_string())).unwrap_err();
        assert!(err.to_string().contains("unsupported provider `geminy`"));
    }

    #[test]
    fn build_cli_overrides_rejects_unknown_provider() {
        let err = build_cli_overrides(
            Some("sk-test".to_string()),
            Some("geminy".to_string()),
            Some("x".to_string()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("unsupported provider `geminy`"));
    }

    #[test]
    fn resolve_state_dir_prefers_the_flag() {
        let dir = resolve_state_dir(Some("/tmp/duet-state".to_string()));
        assert_eq!(dir, PathBuf::from("/tmp/duet-state"));
    }

    #[test]
    fn project_name_comes_from_the_workspace_root() {
        assert_eq!(project_name_for(Path::new("/work/my-app")), "my-app");
    }
}
