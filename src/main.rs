use std::sync::Arc;

use anyhow::Context;
use dialogue_relay::config;
use dialogue_relay::conversation_manager::ConversationManager;
use dialogue_relay::discord_manager::{self, Handler};
use dialogue_relay::ledger::{JsonFileLedger, UsageLedger};
use dialogue_relay::llm::OpenAiClient;
use dotenvy::dotenv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(why) = dotenv() {
        eprintln!("no .env file loaded: {why}");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,serenity=warn")),
        )
        .init();

    let config = config::from_env().context("invalid configuration")?;

    let model =
        Arc::new(OpenAiClient::new(&config.backend).context("failed to build backend client")?);
    let conversations = Arc::new(ConversationManager::new(config.dialogue.clone(), model));

    let ledger: Option<Arc<dyn UsageLedger>> = match &config.usage_ledger_path {
        Some(path) => {
            let ledger = JsonFileLedger::open(path)
                .await
                .with_context(|| format!("failed to open usage ledger {}", path.display()))?;
            info!(path = %ledger.path().display(), "tracking usage");
            Some(Arc::new(ledger))
        }
        None => {
            info!("no usage tracking");
            None
        }
    };

    let handler = Handler::new(
        conversations,
        ledger,
        config.chat_context_count,
        config.support_contact.clone(),
    );

    info!(
        model = %config.dialogue.model,
        messages_in_history = config.dialogue.messages_in_history,
        "starting bot"
    );
    let mut client = discord_manager::build_client(&config.discord_token, handler)
        .await
        .context("failed to create Discord client")?;

    if let Err(why) = client.start().await {
        warn!(error = ?why, "client stopped");
        return Err(why.into());
    }
    Ok(())
}
