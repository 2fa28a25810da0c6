//! Codeforge - Entry Point
//!
//! Drives a single request against a local Ollama backend.
//!
//! Commands:
//! - `generate <task>`: code-generation workflow
//! - `improve <path> <issue>`: self-improvement workflow
//! - `agent <message>`: tool-calling agent

use anyhow::{bail, Context, Result};
use codeforge::agent::{AgentLoop, AgentRequest, ToolExecutor};
use codeforge::llm::ollama::{OllamaBackend, OllamaConfig};
use codeforge::llm::ModelChain;
use codeforge::pipeline::{EventStream, EventTag, LineRange};
use codeforge::retrieval::{CachedRetrieval, Embedder, HashingEmbedder, InMemoryIndex, RetrievalPort};
use codeforge::router::ModelSelector;
use codeforge::sandbox::{SandboxConfig, SandboxShell, SandboxValidator};
use codeforge::workflows::{CodeGenWorkflow, ImproveRequest, ImproveWorkflow, Services};
use codeforge::workspace::LocalWorkspace;
use codeforge::EngineConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const MAX_INDEXED_FILES: usize = 500;

#[derive(Debug, Default)]
struct Cli {
    command: String,
    positional: Vec<String>,
    config: Option<PathBuf>,
    stream: bool,
    json: bool,
    index: bool,
    write: bool,
    session: Option<String>,
    lines: Option<String>,
    related: Vec<String>,
    retries: Option<u32>,
}

fn print_help() {
    println!("Codeforge v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage:");
    println!("  codeforge generate <task> [OPTIONS]");
    println!("  codeforge improve <path> <issue> [OPTIONS]");
    println!("  codeforge agent <message> [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --config <path>     TOML config file (default: $CODEFORGE_CONFIG)");
    println!("  --stream            Print events as they arrive");
    println!("  --json              JSON output and JSON logs on stderr");
    println!("  --index             Index the workspace for retrieval first");
    println!("  --session <id>      Session id for generate");
    println!("  --lines <a-b>       Improve only this line range");
    println!("  --related <a,b>     Related files for improve");
    println!("  --retries <n>       Retry budget for improve");
    println!("  --write             Write validated improvements (with backup)");
    println!("  --help, -h          Show this help");
    println!();
    println!("Environment variables:");
    println!("  OLLAMA_URL                Ollama base URL");
    println!("  CODEFORGE_PRIMARY_MODEL   Primary model id");
    println!("  CODEFORGE_FALLBACK_MODEL  Fallback model id");
    println!("  CODEFORGE_WORKSPACE       Workspace root");
    println!("  RUST_LOG                  Log filter (default: info)");
}

fn parse_args(args: &[String]) -> Result<Option<Cli>> {
    let mut cli = Cli::default();
    let mut iter = args.iter().skip(1);

    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .cloned()
                .with_context(|| format!("{} needs a value", name))
        };
        match arg.as_str() {
            "--help" | "-h" => return Ok(None),
            "--stream" => cli.stream = true,
            "--json" => cli.json = true,
            "--index" => cli.index = true,
            "--write" => cli.write = true,
            "--config" => cli.config = Some(PathBuf::from(value("--config")?)),
            "--session" => cli.session = Some(value("--session")?),
            "--lines" => cli.lines = Some(value("--lines")?),
            "--related" => {
                cli.related = value("--related")?
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }
            "--retries" => {
                let raw = value("--retries")?;
                cli.retries = Some(raw.parse().with_context(|| format!("Invalid --retries '{}'", raw))?);
            }
            flag if flag.starts_with("--") => bail!("Unknown option {}", flag),
            _ if cli.command.is_empty() => cli.command = arg.clone(),
            _ => cli.positional.push(arg.clone()),
        }
    }

    if cli.command.is_empty() {
        return Ok(None);
    }
    Ok(Some(cli))
}

fn init_logging(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        // machine consumers: JSON lines on stderr
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

/// Print a stream; returns false when it ended in an error event
async fn print_events(mut events: EventStream, json: bool) -> Result<bool> {
    let mut ok = true;
    while let Some(event) = events.next().await {
        if json {
            println!("{}", serde_json::to_string(&event)?);
            ok &= event.tag != EventTag::Error;
            continue;
        }
        match event.tag {
            EventTag::Thinking => {}
            EventTag::Plan | EventTag::Tests | EventTag::Code | EventTag::Content => print!("{}", event.content),
            EventTag::Validation | EventTag::ToolCall | EventTag::ToolResult | EventTag::ProposedEdit => {
                println!("\n[{}] {}", event.tag.as_str(), event.content)
            }
            EventTag::Done => println!(),
            EventTag::Error => {
                eprintln!("\nerror: {}", event.content);
                ok = false;
            }
        }
    }
    Ok(ok)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let Some(cli) = parse_args(&args)? else {
        print_help();
        return Ok(());
    };

    init_logging(cli.json)?;
    info!("Codeforge v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::load(cli.config.as_deref())?;

    let backend = Arc::new(OllamaBackend::with_config(OllamaConfig {
        base_url: config.ollama_url.clone(),
        ..Default::default()
    })?);
    let files = Arc::new(LocalWorkspace::new(config.workspace_path()));

    let embedder: Arc<dyn Embedder> = match config.embedder.as_str() {
        "ollama" => backend.clone() as Arc<dyn Embedder>,
        _ => Arc::new(HashingEmbedder::default()),
    };
    let index = Arc::new(InMemoryIndex::new(embedder));
    if cli.index {
        index.index_workspace(files.as_ref(), MAX_INDEXED_FILES).await?;
    }
    let retrieval: Arc<dyn RetrievalPort> =
        Arc::new(CachedRetrieval::new(index, 1_000, Duration::from_secs(600)));

    let selector = Arc::new(config.selector());
    let validator = Arc::new(SandboxValidator::new(config.validator_config()));
    let services = Services::new(backend.clone(), selector.clone(), validator)
        .with_retrieval(retrieval.clone())
        .with_settings(config.generation_settings());

    let ok = match cli.command.as_str() {
        "generate" => {
            let task = cli.positional.join(" ");
            if task.trim().is_empty() {
                bail!("generate needs a task");
            }
            let workflow = CodeGenWorkflow::new(services, config.pipeline_limits())?;
            if cli.stream {
                print_events(workflow.run_streaming(&task, cli.session.clone()), cli.json).await?
            } else {
                let state = workflow.run(&task, cli.session.as_deref()).await?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&state)?);
                } else if let Some(code) = &state.code {
                    print!("{}", code);
                } else {
                    println!("{}", state.response.as_deref().unwrap_or_default());
                }
                // canned answers never reach validation
                state.succeeded() || state.response.is_some()
            }
        }
        "improve" => {
            let [path, issue @ ..] = cli.positional.as_slice() else {
                bail!("improve needs <path> <issue>");
            };
            let issue = issue.join(" ");
            let mut request = ImproveRequest::new(path, &issue)
                .with_related(cli.related.clone())
                .with_auto_write(cli.write || config.auto_write)
                .with_max_retries(cli.retries.unwrap_or(config.max_retries));
            if let Some(lines) = &cli.lines {
                let range = LineRange::parse(lines).with_context(|| format!("Invalid --lines '{}'", lines))?;
                request = request.with_selection(range);
            }

            let workflow = ImproveWorkflow::new(services, files.clone(), config.pipeline_limits())?;
            if cli.stream {
                print_events(workflow.run_streaming(request, None), cli.json).await?
            } else {
                let state = workflow.run(request, None).await?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&state)?);
                } else {
                    print!("{}", state.proposed_full_content.as_deref().unwrap_or_default());
                    if !state.succeeded() {
                        eprintln!(
                            "validation failed after {} retries: {}",
                            state.retry_count,
                            state.last_error.as_deref().unwrap_or("unknown error")
                        );
                    }
                }
                state.succeeded()
            }
        }
        "agent" => {
            let message = cli.positional.join(" ");
            if message.trim().is_empty() {
                bail!("agent needs a message");
            }
            let choice = selector.select(&message);
            let chain = ModelChain::new(backend.clone(), &choice.primary, &choice.fallback)
                .with_temperature(config.temperature);
            let tools = ToolExecutor::new(files.clone())
                .with_shell(Arc::new(SandboxShell::new(SandboxConfig::strict())))
                .with_retrieval(retrieval.clone(), config.retrieval_limit, config.retrieval_min_score)
                .stage_writes(!(cli.write || config.auto_write));
            let agent = AgentLoop::new(chain, tools, config.agent_config()).with_retrieval(retrieval);

            if cli.stream {
                print_events(agent.run_streaming(AgentRequest::new(message)), cli.json).await?
            } else {
                let outcome = agent.run(AgentRequest::new(message)).await?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                } else {
                    println!("{}", outcome.answer);
                    for edit in &outcome.proposed_edits {
                        println!("\n[proposed edit] {}", edit.path);
                    }
                }
                true
            }
        }
        other => bail!("Unknown command '{}', see --help", other),
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
