//! Weaver command implementations

use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weaver_agent::{
    AgentConfig, AgentLoop, CorrectionError, HistoryEntry, Mode, RunInput, RunOutcome,
    SelfCorrector, Strategy, ToolRegistry,
};
use weaver_config::{self, Config};
use weaver_events::{EventEmitter, EventReceiver};
use weaver_provider::{AnthropicClient, ChatClient};

/// Arguments of `weaver run`
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Message to send
    #[arg(short, long)]
    pub message: String,
    /// Task mode
    #[arg(
        long,
        default_value = "general",
        value_parser = ["create", "enhance", "explain", "general"]
    )]
    pub mode: String,
    /// Target project id
    #[arg(long)]
    pub project: Option<String>,
    /// Tenant id passed to tools
    #[arg(long, default_value = "local")]
    pub tenant: String,
    /// User id passed to tools
    #[arg(long, default_value = "cli")]
    pub user: String,
    /// JSON file with prior messages: [{"role": "user", "content": "..."}]
    #[arg(long)]
    pub history: Option<PathBuf>,
    /// Print progress events as JSON lines on stderr
    #[arg(long)]
    pub events: bool,
    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Initialize config
pub async fn init_command() -> Result<()> {
    println!("◆ Initializing Weaver...");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    weaver_config::init()
        .await
        .context("Failed to write default config")?;

    println!("✓ Config at {}", weaver_config::config_path().display());
    println!("\nNext steps:");
    println!(
        "  1. Set {} or add your API key to the config file",
        weaver_config::ENV_API_KEY
    );
    println!("  2. Ask something: weaver run -m \"Build a daily report workflow\"");

    Ok(())
}

/// Show configuration status
pub async fn status_command() -> Result<()> {
    let config_path = weaver_config::config_path();
    let config = Config::load().await.context("Failed to load config")?;

    println!("◆ Weaver Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!(
        "Config:     {} {}",
        config_path.display(),
        if config_path.exists() {
            "[OK]"
        } else {
            "[Missing]"
        }
    );
    println!("Model:      {}", config.chat.model);
    println!("Base URL:   {}", config.chat.base_url);
    println!(
        "API Key:    {}",
        if config.chat.has_api_key() {
            "[Set]"
        } else {
            "[Missing] (offline mock replies)"
        }
    );
    println!(
        "Limits:     {} iterations, {} history messages, {} max tokens",
        config.agent.max_iterations, config.agent.history_limit, config.agent.max_tokens
    );
    println!("Retries:    {}", config.correction.max_retries);

    Ok(())
}

/// Run the agent on one message
pub async fn run_command(args: RunArgs) -> Result<()> {
    let config = Config::load().await.context("Failed to load config")?;

    let history = match &args.history {
        Some(path) => load_history(path).await?,
        None => Vec::new(),
    };

    let client = AnthropicClient::try_from_config(&config.chat)
        .context("Failed to build the HTTP client")?;
    if !client.is_configured() {
        warn!("◆ No API key set, answering from the offline mock");
    }

    let registry = Arc::new(ToolRegistry::new());
    let corrector =
        SelfCorrector::new(config.correction.clone()).with_available_tools(registry.names());

    let mut agent =
        AgentLoop::new(client, registry).with_config(AgentConfig::from(&config.agent));

    let printer = if args.events {
        let (emitter, rx) = EventEmitter::channel(config.agent.event_buffer);
        agent = agent.with_events(emitter);
        Some(tokio::spawn(print_events(rx)))
    } else {
        None
    };

    let cancel = CancellationToken::new();
    let interrupt = spawn_interrupt_handler(cancel.clone());

    let mut input = RunInput::new(&args.message)
        .with_mode(Mode::from_name(&args.mode))
        .with_history(history)
        .with_identity(&args.tenant, &args.user);
    if let Some(project) = &args.project {
        input = input.with_project(project);
    }

    info!("◆ Running in {} mode", input.mode);

    let agent_ref = &agent;
    let cancel_ref = &cancel;
    let base = &input;
    let result = corrector
        .with_correction(config.correction.max_retries, move |previous| {
            let mut attempt = base.clone();
            if let Some(correction) = previous.filter(|c| !c.retry_message.is_empty()) {
                attempt.message = format!("{}\n\n{}", base.message, correction.retry_message);
            }
            async move { agent_ref.run(cancel_ref, attempt).await }
        })
        .await;

    interrupt.abort();
    // Closes the event channel so the printer drains and exits
    drop(agent);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    match result {
        Ok(output) => {
            println!("\n◆ {}", output.response);

            let tools = if output.tools_used.is_empty() {
                "none".to_string()
            } else {
                output.tools_used.join(", ")
            };
            println!(
                "\n━━ {} iteration(s), {} tokens, tools: {}",
                output.iterations, output.total_tokens, tools
            );
            if output.outcome == RunOutcome::MaxIterationsReached {
                println!("━━ stopped at the iteration limit");
            }
            Ok(())
        }
        Err(_) if cancel.is_cancelled() => anyhow::bail!("Run cancelled"),
        Err(CorrectionError::RetryExhausted {
            original,
            correction,
            attempt,
        }) => {
            if correction.strategy == Strategy::Ask {
                println!("◆ The agent could not recover on its own: {}", original);
            }
            anyhow::bail!("Run failed after {} attempt(s): {}", attempt, original)
        }
        Err(e) => Err(e.into()),
    }
}

async fn load_history(path: &Path) -> Result<Vec<HistoryEntry>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read history file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid history file {}", path.display()))
}

async fn print_events(mut rx: EventReceiver) {
    while let Some(event) = rx.recv().await {
        match serde_json::to_string(&event) {
            Ok(line) => eprintln!("{}", line),
            Err(e) => warn!("Failed to encode event: {}", e),
        }
    }
}

fn spawn_interrupt_handler(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("◆ Interrupted, cancelling run");
            cancel.cancel();
        }
    })
}
