use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use agentic_assist::config::{AssistConfig, MailboxConfig};
use agentic_assist::llm::create_provider;
use agentic_assist::mail::{GmailProvider, LocalMailbox, MailProvider};
use agentic_assist::memory::ConversationStore;
use agentic_assist::pipeline::ledger::DraftLedger;
use agentic_assist::pipeline::orchestrator::Orchestrator;
use agentic_assist::pipeline::runner::{run_once, spawn_triage_loop};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let once = std::env::args().skip(1).any(|a| a == "--once");

    let config = AssistConfig::from_env().context("loading configuration")?;

    eprintln!("📬 Agentic Assist v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.llm.model);

    let llm = create_provider(&config.llm).context("creating LLM provider")?;

    let provider: Arc<dyn MailProvider> = match &config.mailbox {
        MailboxConfig::Gmail {
            access_token,
            user_address,
        } => {
            eprintln!("   Mailbox: Gmail ({})", user_address);
            Arc::new(GmailProvider::new(access_token.clone(), user_address.clone()))
        }
        MailboxConfig::Local { root, user_address } => {
            eprintln!("   Mailbox: {} ({})", root.display(), user_address);
            Arc::new(LocalMailbox::new(root.clone(), user_address.clone()))
        }
    };

    let memory = Arc::new(ConversationStore::new(config.memory.clone()));
    let ledger = Arc::new(DraftLedger::new());
    let orchestrator = Arc::new(Orchestrator::from_config(
        provider, llm, memory, ledger, &config,
    )?);

    if once {
        eprintln!("   Mode: single batch\n");
        let cancel = CancellationToken::new();
        let ctrl_c_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, cancelling batch");
                ctrl_c_cancel.cancel();
            }
        });

        let report = run_once(&orchestrator, cancel).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    eprintln!(
        "   Mode: every {}s (Ctrl+C to stop)\n",
        config.pipeline.poll_interval.as_secs()
    );
    let (mut handle, shutdown) = spawn_triage_loop(orchestrator, config.pipeline.poll_interval);

    // The loop only ends on its own after a batch-fatal error.
    let loop_stopped = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("installing Ctrl+C handler")?;
            false
        }
        finished = &mut handle => {
            finished.context("triage loop panicked")?;
            true
        }
    };
    if loop_stopped {
        anyhow::bail!("triage loop stopped: mail provider credentials were rejected");
    }

    tracing::info!("Received Ctrl+C, shutting down");
    shutdown.cancel();
    handle.await.context("triage loop panicked")?;

    Ok(())
}
