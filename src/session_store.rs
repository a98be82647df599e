use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};

use crate::config::DialogueConfig;

pub type UserId = u64;

/// Source of "now" for expiry checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
}

impl Turn {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationState {
    pub user_id: UserId,
    pub role: String,
    pub turns: VecDeque<Turn>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl ConversationState {
    fn fresh(user_id: UserId, role: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            role: role.to_string(),
            turns: VecDeque::new(),
            created_at: now,
            last_active_at: now,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>, max_alive: Duration) -> bool {
        now - self.last_active_at > max_alive
    }
}

/// In-memory map of per-user conversations.
///
/// Expiry is lazy: a stale entry is only replaced when it is next accessed.
/// The turn bound is `2 * messages_in_history` because every user message is
/// stored together with its answer.
pub struct SessionStore {
    states: Mutex<HashMap<UserId, ConversationState>>,
    default_role: String,
    max_turns: usize,
    max_alive: Duration,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new(config: &DialogueConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &DialogueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            default_role: config.default_role.clone(),
            max_turns: config.messages_in_history.saturating_mul(2),
            max_alive: config.max_alive_dialogue,
            clock,
        }
    }

    #[cfg(test)]
    pub(crate) fn max_turns(&self) -> usize {
        self.max_turns
    }

    /// Returns a snapshot of the user's conversation, creating or recreating
    /// it when it is absent or expired.
    pub fn get(&self, user_id: UserId) -> ConversationState {
        let now = self.clock.now();
        let mut states = self.lock();
        self.live_entry(&mut states, user_id, now).clone()
    }

    /// Appends to the conversation loaded by an earlier [`get`](Self::get).
    ///
    /// Expiry is not re-checked here: a state that was valid when the caller
    /// loaded it stays the one that gets updated.
    pub fn append_turn(&self, user_id: UserId, speaker: Speaker, text: &str) {
        self.append_turns(user_id, &[(speaker, text)]);
    }

    /// Records a whole exchange under one lock.
    pub fn append_exchange(&self, user_id: UserId, question: &str, answer: &str) {
        self.append_turns(user_id, &[(Speaker::User, question), (Speaker::Assistant, answer)]);
    }

    fn append_turns(&self, user_id: UserId, turns: &[(Speaker, &str)]) {
        let now = self.clock.now();
        let mut states = self.lock();
        let state = states
            .entry(user_id)
            .or_insert_with(|| ConversationState::fresh(user_id, &self.default_role, now));

        for &(speaker, text) in turns {
            while state.turns.len() >= self.max_turns && !state.turns.is_empty() {
                state.turns.pop_front();
            }
            if self.max_turns > 0 {
                state.turns.push_back(Turn::new(speaker, text));
            }
        }
        state.last_active_at = now;
    }

    /// Replaces the role and starts a fresh conversation. Callers reject
    /// blank roles before getting here.
    pub fn set_role(&self, user_id: UserId, role: &str) {
        let now = self.clock.now();
        let mut states = self.lock();
        let state = states
            .entry(user_id)
            .or_insert_with(|| ConversationState::fresh(user_id, &self.default_role, now));

        state.role = role.to_string();
        state.turns.clear();
        state.created_at = now;
        state.last_active_at = now;
    }

    pub fn reset(&self, user_id: UserId) {
        let now = self.clock.now();
        self.lock()
            .insert(user_id, ConversationState::fresh(user_id, &self.default_role, now));
    }

    fn live_entry<'a>(
        &self,
        states: &'a mut HashMap<UserId, ConversationState>,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> &'a mut ConversationState {
        let state = states
            .entry(user_id)
            .or_insert_with(|| ConversationState::fresh(user_id, &self.default_role, now));

        if state.is_expired(now, self.max_alive) {
            tracing::debug!(user_id, "conversation expired, starting a new one");
            *state = ConversationState::fresh(user_id, &self.default_role, now);
        }
        state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, ConversationState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
