use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};

use crate::config::DialogueConfig;
use crate::conversation_manager::{ChatContextEntry, ConversationManager, DialogueError};
use crate::llm::{ChatMessage, ChatRole, Completion, GenerationPolicy, LanguageModel, LlmError};
use crate::session_store::tests::ManualClock;
use crate::session_store::{Clock, SessionStore, Speaker};

/// Replays queued results and records every prompt it is sent.
#[derive(Default)]
struct ScriptedModel {
    results: Mutex<VecDeque<Result<Completion, LlmError>>>,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
    policies: Mutex<Vec<GenerationPolicy>>,
    delay: Option<StdDuration>,
    /// Moves the clock forward while a completion is "running".
    clock_step: Option<(Arc<ManualClock>, Duration)>,
}

impl ScriptedModel {
    fn answering(answers: &[(&str, u64)]) -> Self {
        let model = Self::default();
        for (text, tokens) in answers {
            model.push(Ok(Completion {
                text: text.to_string(),
                total_tokens: *tokens,
            }));
        }
        model
    }

    fn push(&self, result: Result<Completion, LlmError>) {
        self.results.lock().unwrap().push_back(result);
    }

    fn prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        policy: &GenerationPolicy,
    ) -> Result<Completion, LlmError> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        self.policies.lock().unwrap().push(policy.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((clock, step)) = &self.clock_step {
            clock.advance(*step);
        }
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(LlmError::EmptyCompletion))
    }
}

fn dialogue_config(messages_in_history: usize) -> DialogueConfig {
    DialogueConfig {
        default_role: "You are a helpful assistant.".to_string(),
        messages_in_history,
        max_alive_dialogue: Duration::seconds(300),
        model: "test-model".to_string(),
        temperature: 0.5,
        max_tokens: 256,
    }
}

fn manager_with(
    messages_in_history: usize,
    model: Arc<ScriptedModel>,
) -> (ConversationManager, Arc<ManualClock>) {
    let config = dialogue_config(messages_in_history);
    let clock = ManualClock::new();
    let store = SessionStore::with_clock(&config, clock.clone());
    (ConversationManager::with_store(config, store, model), clock)
}

fn overloaded() -> LlmError {
    LlmError::Overloaded {
        status: 503,
        message: "The server is overloaded".to_string(),
    }
}

fn turn_texts(manager: &ConversationManager, user_id: u64) -> Vec<(Speaker, String)> {
    manager
        .conversation(user_id)
        .turns
        .into_iter()
        .map(|turn| (turn.speaker, turn.text))
        .collect()
}

#[tokio::test]
async fn test_exchange_returns_answer_and_tokens() {
    let model = Arc::new(ScriptedModel::answering(&[("Hello!", 42)]));
    let (manager, _clock) = manager_with(5, model.clone());

    let (answer, tokens) = manager.on_message_with_context("hi", 1, &[]).await.unwrap();

    assert_eq!(answer, "Hello!");
    assert_eq!(tokens, 42);
    assert_eq!(
        turn_texts(&manager, 1),
        vec![(Speaker::User, "hi".to_string()), (Speaker::Assistant, "Hello!".to_string())]
    );

    let policies = model.policies.lock().unwrap().clone();
    assert_eq!(
        policies,
        vec![GenerationPolicy {
            model: "test-model".to_string(),
            temperature: 0.5,
            max_tokens: 256,
        }]
    );
}

#[tokio::test]
async fn test_history_keeps_latest_exchanges() {
    let model = Arc::new(ScriptedModel::answering(&[("a1", 1), ("a2", 1), ("a3", 1)]));
    let (manager, _clock) = manager_with(2, model.clone());

    for text in ["u1", "u2", "u3"] {
        manager.on_message_with_context(text, 1, &[]).await.unwrap();
    }

    let texts: Vec<String> = turn_texts(&manager, 1).into_iter().map(|(_, t)| t).collect();
    assert_eq!(texts, vec!["u2", "a2", "u3", "a3"]);

    // The third prompt carried both earlier exchanges.
    let third = &model.prompts()[2];
    let contents: Vec<&str> = third.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["You are a helpful assistant.", "u1", "a1", "u2", "a2", "u3"]);
}

#[tokio::test]
async fn test_history_never_exceeds_bound() {
    let answers: Vec<(&str, u64)> = (0..10).map(|_| ("ok", 1)).collect();
    let model = Arc::new(ScriptedModel::answering(&answers));
    let (manager, _clock) = manager_with(3, model);

    for i in 0..10 {
        manager.on_message_with_context(&format!("m{i}"), 1, &[]).await.unwrap();
        assert!(manager.conversation(1).turns.len() <= 6);
    }
}

#[tokio::test]
async fn test_context_is_injected_but_not_stored() {
    let model = Arc::new(ScriptedModel::answering(&[("noted", 10)]));
    let (manager, _clock) = manager_with(5, model.clone());

    let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let context: Vec<ChatContextEntry> = (1..=5)
        .map(|i| ChatContextEntry {
            user_name: format!("User{i}"),
            text: format!("message {i}"),
            timestamp: base + Duration::minutes(i),
        })
        .collect();

    manager
        .on_message_with_context("summarize please", 1, &context)
        .await
        .unwrap();

    let prompt = &model.prompts()[0];
    assert_eq!(prompt.len(), 3);
    assert_eq!(prompt[0], ChatMessage::system("You are a helpful assistant."));
    assert_eq!(prompt[1].role, ChatRole::System);
    let lines: Vec<&str> = prompt[1].content.lines().skip(1).collect();
    assert_eq!(
        lines,
        vec![
            "User1: message 1",
            "User2: message 2",
            "User3: message 3",
            "User4: message 4",
            "User5: message 5",
        ]
    );
    assert_eq!(prompt[2], ChatMessage::user("summarize please"));

    let stored = turn_texts(&manager, 1);
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|(_, text)| !text.contains("message 3")));
}

#[tokio::test]
async fn test_backend_failure_leaves_history_untouched() {
    let model = Arc::new(ScriptedModel::answering(&[("first", 5)]));
    model.push(Err(overloaded()));
    let (manager, _clock) = manager_with(5, model);

    manager.on_message_with_context("one", 1, &[]).await.unwrap();
    let before = manager.conversation(1);

    let err = manager.on_message_with_context("two", 1, &[]).await.unwrap_err();

    assert!(matches!(err, DialogueError::ModelBackend(LlmError::Overloaded { .. })));
    assert_eq!(manager.conversation(1), before);
}

#[tokio::test]
async fn test_malformed_completion_is_unknown_failure() {
    let model = Arc::new(ScriptedModel::default());
    let (manager, _clock) = manager_with(5, model);

    let err = manager.on_message_with_context("hello", 1, &[]).await.unwrap_err();

    assert!(matches!(err, DialogueError::Unknown(_)));
    assert!(manager.conversation(1).turns.is_empty());
}

#[tokio::test]
async fn test_set_role_starts_fresh_conversation() {
    let model = Arc::new(ScriptedModel::answering(&[("a1", 1), ("arr", 1)]));
    let (manager, _clock) = manager_with(5, model.clone());

    manager.on_message_with_context("u1", 1, &[]).await.unwrap();
    manager.set_role(1, "  You are a pirate.  ").await.unwrap();

    assert_eq!(manager.get_role(1), "You are a pirate.");
    assert!(manager.conversation(1).turns.is_empty());

    manager.on_message_with_context("hello", 1, &[]).await.unwrap();
    let prompt = &model.prompts()[1];
    assert_eq!(
        prompt,
        &vec![ChatMessage::system("You are a pirate."), ChatMessage::user("hello")]
    );
}

#[tokio::test]
async fn test_blank_role_is_rejected_without_changes() {
    let model = Arc::new(ScriptedModel::answering(&[("a1", 1)]));
    let (manager, _clock) = manager_with(5, model.clone());
    manager.on_message_with_context("u1", 1, &[]).await.unwrap();
    let before = manager.conversation(1);

    for role in ["", "   ", "\n\t"] {
        assert!(matches!(manager.set_role(1, role).await, Err(DialogueError::InvalidRole)));
    }

    assert_eq!(manager.conversation(1), before);
    assert_eq!(model.prompts().len(), 1);
}

#[tokio::test]
async fn test_reset_restores_default_role() {
    let model = Arc::new(ScriptedModel::answering(&[("a1", 1)]));
    let (manager, _clock) = manager_with(5, model);

    manager.set_role(1, "You are a pirate.").await.unwrap();
    manager.on_message_with_context("u1", 1, &[]).await.unwrap();

    manager.reset(1).await;
    let once = manager.conversation(1);
    manager.reset(1).await;

    assert_eq!(once.role, "You are a helpful assistant.");
    assert!(once.turns.is_empty());
    assert_eq!(manager.conversation(1), once);
}

#[tokio::test]
async fn test_idle_conversation_expires() {
    let model = Arc::new(ScriptedModel::answering(&[("a1", 1), ("a2", 1)]));
    let (manager, clock) = manager_with(5, model.clone());

    manager.set_role(1, "You are a pirate.").await.unwrap();
    manager.on_message_with_context("u1", 1, &[]).await.unwrap();

    clock.advance(Duration::seconds(301));
    assert_eq!(manager.get_role(1), "You are a helpful assistant.");

    manager.on_message_with_context("u2", 1, &[]).await.unwrap();
    let prompt = &model.prompts()[1];
    assert_eq!(
        prompt,
        &vec![ChatMessage::system("You are a helpful assistant."), ChatMessage::user("u2")]
    );
}

#[tokio::test]
async fn test_same_user_exchanges_are_serialized() {
    let model = Arc::new(ScriptedModel {
        delay: Some(StdDuration::from_millis(20)),
        ..ScriptedModel::answering(&[("a1", 1), ("a2", 1)])
    });
    let (manager, _clock) = manager_with(5, model.clone());

    let (first, second) = tokio::join!(
        manager.on_message_with_context("u1", 1, &[]),
        manager.on_message_with_context("u2", 1, &[]),
    );
    first.unwrap();
    second.unwrap();

    // The second exchange saw the first one's turns instead of racing it.
    let prompts = model.prompts();
    assert_eq!(prompts[1].len(), 4);
    let texts: Vec<String> = turn_texts(&manager, 1).into_iter().map(|(_, t)| t).collect();
    assert_eq!(texts, vec!["u1", "a1", "u2", "a2"]);
    assert_eq!(manager.tracked_users(), 0);
}

#[tokio::test]
async fn test_ttl_running_out_mid_exchange_keeps_conversation() {
    let config = dialogue_config(5);
    let clock = ManualClock::new();
    let model = Arc::new(ScriptedModel {
        clock_step: Some((clock.clone(), Duration::seconds(20))),
        ..ScriptedModel::answering(&[("answer", 7)])
    });
    let store = SessionStore::with_clock(&config, clock.clone());
    let manager = ConversationManager::with_store(config, store, model);

    manager.set_role(1, "You are a pirate.").await.unwrap();
    clock.advance(Duration::seconds(290));

    let (answer, tokens) = manager.on_message_with_context("ahoy", 1, &[]).await.unwrap();

    assert_eq!((answer.as_str(), tokens), ("answer", 7));
    let state = manager.conversation(1);
    assert_eq!(state.role, "You are a pirate.");
    assert_eq!(
        turn_texts(&manager, 1),
        vec![(Speaker::User, "ahoy".to_string()), (Speaker::Assistant, "answer".to_string())]
    );
    assert_eq!(state.last_active_at, clock.now());
}

#[tokio::test]
async fn test_reset_waits_for_in_flight_exchange() {
    let model = Arc::new(ScriptedModel {
        delay: Some(StdDuration::from_millis(20)),
        ..ScriptedModel::answering(&[("a1", 1)])
    });
    let (manager, _clock) = manager_with(5, model);
    manager.set_role(1, "You are a pirate.").await.unwrap();

    let (exchange, ()) = tokio::join!(
        manager.on_message_with_context("u1", 1, &[]),
        manager.reset(1),
    );
    exchange.unwrap();

    let state = manager.conversation(1);
    assert!(state.turns.is_empty());
    assert_eq!(state.role, "You are a helpful assistant.");
}

#[tokio::test]
async fn test_user_locks_are_released_after_use() {
    let model = Arc::new(ScriptedModel::answering(&[("a1", 1)]));
    let (manager, _clock) = manager_with(5, model);

    manager.on_message_with_context("u1", 1, &[]).await.unwrap();
    manager.reset(2).await;
    manager.set_role(3, "You are a pirate.").await.unwrap();
    manager.on_message_with_context("u4", 4, &[]).await.unwrap_err();

    assert_eq!(manager.tracked_users(), 0);
}
