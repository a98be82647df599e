use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::config::DialogueConfig;
use crate::llm::{ChatMessage, GenerationPolicy, LanguageModel, LlmError};
use crate::session_store::{ConversationState, SessionStore, Speaker, UserId};

/// One message from the surrounding chat, supplied fresh on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatContextEntry {
    pub user_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum DialogueError {
    #[error("role must not be empty")]
    InvalidRole,

    #[error("language model backend failed: {0}")]
    ModelBackend(#[source] LlmError),

    #[error("unexpected failure: {0}")]
    Unknown(String),
}

impl From<LlmError> for DialogueError {
    fn from(err: LlmError) -> Self {
        if err.is_backend_failure() {
            Self::ModelBackend(err)
        } else {
            Self::Unknown(err.to_string())
        }
    }
}

type LockMap = Mutex<HashMap<UserId, Arc<AsyncMutex<()>>>>;

/// Owns the per-user conversations and runs one exchange with the model per
/// incoming message.
pub struct ConversationManager {
    store: SessionStore,
    model: Arc<dyn LanguageModel>,
    policy: GenerationPolicy,
    config: DialogueConfig,
    user_locks: LockMap,
}

impl ConversationManager {
    pub fn new(config: DialogueConfig, model: Arc<dyn LanguageModel>) -> Self {
        let store = SessionStore::new(&config);
        Self::with_store(config, store, model)
    }

    pub fn with_store(
        config: DialogueConfig,
        store: SessionStore,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        let policy = GenerationPolicy {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        };

        Self {
            store,
            model,
            policy,
            config,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DialogueConfig {
        &self.config
    }

    pub fn conversation(&self, user_id: UserId) -> ConversationState {
        self.store.get(user_id)
    }

    pub fn get_role(&self, user_id: UserId) -> String {
        self.store.get(user_id).role
    }

    /// Waits for any in-flight exchange of this user, then replaces the role
    /// and clears the history.
    pub async fn set_role(&self, user_id: UserId, role: &str) -> Result<(), DialogueError> {
        let role = role.trim();
        if role.is_empty() {
            return Err(DialogueError::InvalidRole);
        }

        let _slot = self.lock_user(user_id).await;
        self.store.set_role(user_id, role);
        info!(user_id, "role updated, history cleared");
        Ok(())
    }

    pub async fn reset(&self, user_id: UserId) {
        let _slot = self.lock_user(user_id).await;
        self.store.reset(user_id);
        info!(user_id, "conversation reset");
    }

    /// Runs a single exchange and returns the answer together with the total
    /// number of tokens the backend charged for it.
    ///
    /// Exchanges for the same user are serialized; the history is only
    /// updated when the backend call succeeds.
    pub async fn on_message_with_context(
        &self,
        text: &str,
        user_id: UserId,
        external_context: &[ChatContextEntry],
    ) -> Result<(String, u64), DialogueError> {
        let _slot = self.lock_user(user_id).await;

        let state = self.store.get(user_id);
        let prompt = build_prompt(&state, external_context, text);

        let completion = match self.model.complete(&prompt, &self.policy).await {
            Ok(completion) => completion,
            Err(err) => {
                let err = DialogueError::from(err);
                match &err {
                    DialogueError::ModelBackend(cause) => {
                        warn!(user_id, error = %cause, "model backend failed")
                    }
                    other => error!(user_id, error = %other, "exchange failed"),
                }
                return Err(err);
            }
        };

        self.store.append_exchange(user_id, text, &completion.text);

        info!(
            user_id,
            tokens = completion.total_tokens,
            context = external_context.len(),
            "exchange completed"
        );
        Ok((completion.text, completion.total_tokens))
    }

    async fn lock_user(&self, user_id: UserId) -> UserSlot<'_> {
        let lock = {
            let mut locks = self.user_locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(user_id).or_default().clone()
        };
        let guard = lock.lock_owned().await;

        UserSlot {
            locks: &self.user_locks,
            user_id,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_users(&self) -> usize {
        self.user_locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Exclusive access to one user's conversation. The user's lock is dropped
/// from the map once no other caller is holding or waiting for it.
struct UserSlot<'a> {
    locks: &'a LockMap,
    user_id: UserId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserSlot<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.user_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.user_id);
        }
    }
}

/// Assembles the outbound prompt: role, ambient chat block, the user's own
/// history, then the new message.
pub fn build_prompt(
    state: &ConversationState,
    external_context: &[ChatContextEntry],
    text: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(state.turns.len() + 3);
    messages.push(ChatMessage::system(state.role.as_str()));

    if !external_context.is_empty() {
        messages.push(ChatMessage::system(render_chat_context(external_context)));
    }

    messages.extend(state.turns.iter().map(|turn| match turn.speaker {
        Speaker::User => ChatMessage::user(turn.text.as_str()),
        Speaker::Assistant => ChatMessage::assistant(turn.text.as_str()),
    }));

    messages.push(ChatMessage::user(text));
    messages
}

pub fn render_chat_context(entries: &[ChatContextEntry]) -> String {
    let mut block = String::from("Recent messages in this chat:");
    for entry in entries {
        block.push('\n');
        block.push_str(&entry.user_name);
        block.push_str(": ");
        block.push_str(&entry.text);
    }
    block
}
