use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serenity::async_trait;
use serenity::client::Client;
use serenity::model::channel::Message;
use serenity::model::gateway::Ready;
use serenity::prelude::*;
use tracing::{error, info, warn};

use crate::commands::{self, Command};
use crate::conversation_manager::{ChatContextEntry, ConversationManager, DialogueError};
use crate::ledger::UsageLedger;

pub struct Handler {
    conversations: Arc<ConversationManager>,
    ledger: Option<Arc<dyn UsageLedger>>,
    chat_context_count: u64,
    support_contact: Option<String>,
}

impl Handler {
    pub fn new(
        conversations: Arc<ConversationManager>,
        ledger: Option<Arc<dyn UsageLedger>>,
        chat_context_count: u64,
        support_contact: Option<String>,
    ) -> Self {
        Self {
            conversations,
            ledger,
            chat_context_count,
            support_contact,
        }
    }

    async fn reply(&self, context: &Context, msg: &Message, text: &str) {
        for chunk in commands::split_message(text) {
            if let Err(why) = msg.channel_id.say(&context.http, &chunk).await {
                error!(channel_id = msg.channel_id.0, error = ?why, "error sending message");
                return;
            }
        }
    }

    /// Recent channel messages before `msg`, oldest first. A failed fetch
    /// only costs the model some context.
    async fn chat_context(&self, context: &Context, msg: &Message) -> Vec<ChatContextEntry> {
        if self.chat_context_count == 0 {
            return vec![];
        }

        let history = msg
            .channel_id
            .messages(&context.http, |retriever| {
                retriever.before(msg.id).limit(self.chat_context_count)
            })
            .await;

        match history {
            Ok(messages) => messages
                .into_iter()
                .rev()
                .filter(|m| !m.author.bot && !m.content.trim().is_empty())
                .map(|m| ChatContextEntry {
                    user_name: display_name(&m),
                    timestamp: Utc
                        .timestamp_opt(m.timestamp.unix_timestamp(), 0)
                        .single()
                        .unwrap_or_else(Utc::now),
                    text: m.content,
                })
                .collect(),
            Err(why) => {
                warn!(channel_id = msg.channel_id.0, error = ?why, "could not fetch chat history");
                vec![]
            }
        }
    }

    async fn handle_chat(
        &self,
        context: &Context,
        msg: &Message,
        user_id: u64,
        text: &str,
    ) -> String {
        let chat_context = self.chat_context(context, msg).await;

        if let Err(why) = msg.channel_id.broadcast_typing(&context.http).await {
            warn!(error = ?why, "could not show typing indicator");
        }

        match self
            .conversations
            .on_message_with_context(text, user_id, &chat_context)
            .await
        {
            Ok((answer, total_tokens)) => {
                if let Some(ledger) = &self.ledger {
                    let name = display_name(msg);
                    if let Err(why) = ledger.record(user_id, &name, total_tokens).await {
                        error!(user_id, error = %why, "could not record usage");
                    }
                }
                answer
            }
            Err(DialogueError::ModelBackend(_)) => commands::BACKEND_ERROR_MESSAGE.to_string(),
            Err(DialogueError::InvalidRole) => commands::ROLE_USAGE_MESSAGE.to_string(),
            Err(DialogueError::Unknown(_)) => commands::SYSTEM_ERROR_MESSAGE.to_string(),
        }
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn message(&self, context: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        let bot_id = context.cache.current_user_id().0;
        let is_direct = msg.guild_id.is_none();
        if !commands::is_addressed(&msg.content, bot_id, is_direct) {
            return;
        }

        let user_id = msg.author.id.0;
        let text = commands::strip_mentions(&msg.content, bot_id);
        info!(user_id, channel_id = msg.channel_id.0, "message received");

        let response = match Command::parse(&text) {
            Command::Help => {
                let role = self.conversations.get_role(user_id);
                let contact = self.support_contact.as_deref();
                commands::render_help(&role, self.conversations.config(), contact)
            }
            Command::Reset => {
                self.conversations.reset(user_id).await;
                commands::RESET_MESSAGE.to_string()
            }
            Command::Role(role) => match self.conversations.set_role(user_id, role).await {
                Ok(()) => commands::ROLE_SET_MESSAGE.to_string(),
                Err(_) => commands::ROLE_USAGE_MESSAGE.to_string(),
            },
            Command::Chat("") => return,
            Command::Chat(text) => self.handle_chat(&context, &msg, user_id, text).await,
        };

        self.reply(&context, &msg, &response).await;
    }

    async fn ready(&self, _: Context, ready: Ready) {
        info!("{} is connected!", ready.user.name);
    }
}

fn display_name(msg: &Message) -> String {
    msg.member
        .as_ref()
        .and_then(|member| member.nick.clone())
        .unwrap_or_else(|| msg.author.name.clone())
}

pub async fn build_client(token: &str, handler: Handler) -> Result<Client, SerenityError> {
    let intents = GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    Client::builder(token, intents).event_handler(handler).await
}
