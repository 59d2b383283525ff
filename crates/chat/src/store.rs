//! Conversation state, the streaming reply flow, and its persistence.
//!
//! [`ConversationStore`] is the only writer of the message list. Every
//! mutation is published as a [`ConversationSnapshot`] on a watch channel and
//! then persisted under the same lock, so storage always sees the
//! post-mutation state. Commits that leave the persistable messages unchanged
//! skip the write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use sahai_llm::{ModelSession, ProviderResult};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::connectivity::ConnectivityGate;
use super::history::{HistoryError, PersistedHistory};
use super::message::{Message, MessageId};

pub const GREETING_PROMPT: &str = "Introduce yourself";
pub const OFFLINE_WELCOME_TEXT: &str = "Welcome! You seem to be offline. Connect to the internet to start chatting with Sah.ai. 🙏";
pub const GREETING_FAILED_TEXT: &str = "Oh no! I couldn't get started. Please check your connection and API key, then refresh the page. 🙏";
pub const OFFLINE_SEND_TEXT: &str =
    "You're offline. Please check your connection and try again. 🔌";
pub const SEND_FAILED_TEXT: &str = "Oops! Something went wrong. Maybe ask a different question? 🤔";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSnapshot {
    pub messages: Vec<Message>,
    pub is_loading: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Restored { count: usize },
    Greeted(GreetingOutcome),
    OfflineWelcome,
    AlreadyInitialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreetingOutcome {
    Completed,
    Failed,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Completed,
    EmptyInput,
    Offline,
    Busy,
    Failed,
}

pub struct ConversationStore {
    session: Arc<dyn ModelSession>,
    history: PersistedHistory,
    connectivity: ConnectivityGate,
    snapshots: watch::Sender<ConversationSnapshot>,
    /// Persistable messages as last written; also serializes commits.
    persisted: Mutex<Vec<Message>>,
    initialized: AtomicBool,
    in_flight: AtomicBool,
}

impl ConversationStore {
    pub fn new(
        session: Arc<dyn ModelSession>,
        history: PersistedHistory,
        connectivity: ConnectivityGate,
    ) -> Self {
        let (snapshots, _) = watch::channel(ConversationSnapshot {
            messages: Vec::new(),
            is_loading: true,
        });
        Self {
            session,
            history,
            connectivity,
            snapshots,
            persisted: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationSnapshot> {
        self.snapshots.subscribe()
    }

    /// Restores saved history or starts a fresh conversation. Only the first
    /// call does anything.
    pub async fn initialize(&self) -> InitOutcome {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return InitOutcome::AlreadyInitialized;
        }

        if let Some(messages) = self.load_history() {
            let count = messages.len();
            self.persisted_messages().clone_from(&messages);
            self.commit(|snapshot| {
                snapshot.messages = messages;
                snapshot.is_loading = false;
            });
            tracing::info!(count, "restored chat history");
            return InitOutcome::Restored { count };
        }

        if self.connectivity.is_online() {
            return InitOutcome::Greeted(self.fetch_greeting().await);
        }

        self.commit(|snapshot| {
            snapshot.messages = vec![Message::error(OFFLINE_WELCOME_TEXT)];
            snapshot.is_loading = false;
        });
        InitOutcome::OfflineWelcome
    }

    /// Replaces the conversation with a freshly streamed greeting.
    pub async fn fetch_greeting(&self) -> GreetingOutcome {
        let Some(_flight) = self.begin_flight() else {
            tracing::debug!("greeting skipped, a reply is already streaming");
            return GreetingOutcome::Busy;
        };

        let placeholder = Message::model_placeholder();
        self.commit(|snapshot| snapshot.messages = vec![placeholder.clone()]);

        let result = self
            .stream_reply(GREETING_PROMPT, |messages, reply| {
                *messages = vec![Message {
                    content: reply.to_string(),
                    ..placeholder.clone()
                }];
            })
            .await;

        match result {
            Ok(()) => {
                tracing::info!("greeting fetched");
                GreetingOutcome::Completed
            }
            Err(error) => {
                tracing::warn!(error = %error, "greeting failed");
                self.commit(|snapshot| {
                    snapshot.messages = vec![Message::error(GREETING_FAILED_TEXT)];
                });
                GreetingOutcome::Failed
            }
        }
    }

    pub async fn send_message(&self, text: &str) -> SendOutcome {
        if text.trim().is_empty() {
            return SendOutcome::EmptyInput;
        }

        if !self.connectivity.is_online() {
            self.commit(|snapshot| snapshot.messages.push(Message::error(OFFLINE_SEND_TEXT)));
            return SendOutcome::Offline;
        }

        let Some(_flight) = self.begin_flight() else {
            return SendOutcome::Busy;
        };

        let placeholder = Message::model_placeholder();
        let placeholder_id = placeholder.id.clone();
        self.commit(|snapshot| {
            snapshot.messages.push(Message::user(text));
            snapshot.messages.push(placeholder);
        });

        let result = self
            .stream_reply(text, |messages, reply| {
                if let Some(message) = find_message(messages, &placeholder_id) {
                    message.content = reply.to_string();
                }
            })
            .await;

        match result {
            Ok(()) => SendOutcome::Completed,
            Err(error) => {
                tracing::warn!(error = %error, "message send failed");
                self.commit(|snapshot| {
                    snapshot.messages.retain(|message| message.id != placeholder_id);
                    snapshot.messages.push(Message::error(SEND_FAILED_TEXT));
                });
                SendOutcome::Failed
            }
        }
    }

    /// Re-runs the greeting when online and the conversation holds nothing
    /// but ERROR messages.
    pub async fn retry_if_stalled(&self) -> Option<GreetingOutcome> {
        if !self.connectivity.is_online() {
            return None;
        }

        let stalled = {
            let snapshot = self.snapshots.borrow();
            !snapshot.messages.is_empty() && snapshot.messages.iter().all(Message::is_error)
        };
        if !stalled {
            return None;
        }

        tracing::info!("connection is back, retrying greeting");
        Some(self.fetch_greeting().await)
    }

    /// Calls [`Self::retry_if_stalled`] once at start, then on every
    /// transition of the connectivity gate to online.
    pub fn spawn_auto_retry(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let mut updates = self.connectivity.subscribe();
        tokio::spawn(async move {
            store.retry_if_stalled().await;
            while updates.changed().await.is_ok() {
                let online = *updates.borrow_and_update();
                if online {
                    store.retry_if_stalled().await;
                }
            }
        })
    }

    async fn stream_reply<F>(&self, prompt: &str, apply: F) -> ProviderResult<()>
    where
        F: Fn(&mut Vec<Message>, &str),
    {
        let mut chunks = self.session.send_message_stream(prompt)?;
        let mut reply = String::new();
        while let Some(chunk) = chunks.next().await {
            reply.push_str(&chunk?.text);
            self.commit(|snapshot| apply(&mut snapshot.messages, &reply));
        }
        Ok(())
    }

    fn load_history(&self) -> Option<Vec<Message>> {
        match self.history.load() {
            Ok(messages) => messages,
            Err(error @ HistoryError::Decode { .. }) => {
                tracing::warn!(error = %error, "discarding corrupt chat history");
                if let Err(error) = self.history.clear() {
                    tracing::warn!(error = %error, "failed to remove corrupt chat history");
                }
                None
            }
            Err(error) => {
                tracing::warn!(error = %error, "chat history unavailable, starting fresh");
                None
            }
        }
    }

    fn persisted_messages(&self) -> MutexGuard<'_, Vec<Message>> {
        self.persisted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn commit(&self, mutate: impl FnOnce(&mut ConversationSnapshot)) {
        let mut persisted = self.persisted_messages();
        self.snapshots.send_modify(mutate);
        let persistable: Vec<Message> = self
            .snapshots
            .borrow()
            .messages
            .iter()
            .filter(|message| message.is_persistable())
            .cloned()
            .collect();
        if persistable.is_empty() || persistable == *persisted {
            return;
        }

        match self.history.save(&persistable) {
            Ok(_) => {
                tracing::trace!(count = persistable.len(), "chat history saved");
                *persisted = persistable;
            }
            Err(error) => tracing::warn!(error = %error, "failed to persist chat history"),
        }
    }

    fn set_loading(&self, loading: bool) {
        self.snapshots.send_if_modified(|snapshot| {
            if snapshot.is_loading == loading {
                return false;
            }
            snapshot.is_loading = loading;
            true
        });
    }

    fn begin_flight(&self) -> Option<FlightGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.set_loading(true);
        Some(FlightGuard { store: self })
    }
}

/// Holds the single-flight slot; releasing it also clears the loading flag.
struct FlightGuard<'a> {
    store: &'a ConversationStore,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.store.in_flight.store(false, Ordering::Release);
        self.store.set_loading(false);
    }
}

fn find_message<'a>(messages: &'a mut [Message], id: &MessageId) -> Option<&'a mut Message> {
    messages.iter_mut().find(|message| &message.id == id)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures::channel::mpsc;
    use futures::stream;
    use sahai_llm::{ProviderError, TextChunk, TextChunkStream, TurnId};
    use sahai_storage::{KeyValueStore, MemoryStorage, StorageResult};

    use super::*;
    use crate::history::CHAT_HISTORY_KEY;
    use crate::message::Role;

    enum Reply {
        Chunks(Vec<&'static str>),
        FailAfter(Vec<&'static str>),
        Refuse,
        Channel(mpsc::UnboundedReceiver<ProviderResult<TextChunk>>),
    }

    struct ScriptedSession {
        replies: Mutex<VecDeque<Reply>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedSession {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    fn stream_failed() -> ProviderError {
        ProviderError::StreamFailed {
            stage: "scripted",
            turn: TurnId::new(1),
            message: "boom".to_string(),
        }
    }

    impl ModelSession for ScriptedSession {
        fn send_message_stream(&self, prompt: &str) -> ProviderResult<TextChunkStream> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Reply::Refuse);

            match reply {
                Reply::Chunks(chunks) => Ok(stream::iter(
                    chunks.into_iter().map(|text| Ok(TextChunk::new(text))),
                )
                .boxed()),
                Reply::FailAfter(chunks) => Ok(stream::iter(
                    chunks
                        .into_iter()
                        .map(|text| Ok(TextChunk::new(text)))
                        .chain(std::iter::once(Err(stream_failed()))),
                )
                .boxed()),
                Reply::Refuse => Err(ProviderError::StreamClosed {
                    stage: "scripted",
                    turn: TurnId::new(1),
                }),
                Reply::Channel(receiver) => Ok(receiver.boxed()),
            }
        }
    }

    struct Harness {
        session: Arc<ScriptedSession>,
        storage: Arc<MemoryStorage>,
        gate: ConnectivityGate,
        store: Arc<ConversationStore>,
    }

    fn harness(replies: Vec<Reply>, online: bool) -> Harness {
        harness_with_storage(replies, online, Arc::new(MemoryStorage::new()))
    }

    fn harness_with_storage(
        replies: Vec<Reply>,
        online: bool,
        storage: Arc<MemoryStorage>,
    ) -> Harness {
        let session = ScriptedSession::new(replies);
        let gate = ConnectivityGate::new(online);
        let store = Arc::new(ConversationStore::new(
            session.clone(),
            PersistedHistory::new(storage.clone()),
            gate.clone(),
        ));
        Harness {
            session,
            storage,
            gate,
            store,
        }
    }

    /// Counts writes that reach the wrapped storage.
    #[derive(Default)]
    struct CountingStorage {
        inner: MemoryStorage,
        writes: AtomicUsize,
    }

    impl CountingStorage {
        fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    impl KeyValueStore for CountingStorage {
        fn get(&self, key: &str) -> StorageResult<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> StorageResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> StorageResult<()> {
            self.inner.remove(key)
        }
    }

    fn counting_store(
        replies: Vec<Reply>,
        online: bool,
    ) -> (Arc<ScriptedSession>, Arc<CountingStorage>, ConnectivityGate, ConversationStore) {
        let session = ScriptedSession::new(replies);
        let storage = Arc::new(CountingStorage::default());
        let gate = ConnectivityGate::new(online);
        let store = ConversationStore::new(
            session.clone(),
            PersistedHistory::new(storage.clone()),
            gate.clone(),
        );
        (session, storage, gate, store)
    }

    fn stored_messages(storage: &MemoryStorage) -> Option<Vec<Message>> {
        storage
            .get(CHAT_HISTORY_KEY)
            .unwrap()
            .map(|raw| serde_json::from_str(&raw).unwrap())
    }

    fn roles_and_contents(messages: &[Message]) -> Vec<(Role, &str)> {
        messages
            .iter()
            .map(|message| (message.role, message.content.as_str()))
            .collect()
    }

    fn last_model_content(snapshot: &ConversationSnapshot) -> Option<&str> {
        snapshot
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::Model)
            .map(|message| message.content.as_str())
    }

    #[tokio::test]
    async fn fresh_start_online_streams_greeting() {
        let harness = harness(vec![Reply::Chunks(vec!["Namaste", "! 🙏"])], true);
        assert!(harness.store.snapshot().is_loading);

        let outcome = harness.store.initialize().await;

        assert_eq!(outcome, InitOutcome::Greeted(GreetingOutcome::Completed));
        let snapshot = harness.store.snapshot();
        assert!(!snapshot.is_loading);
        assert_eq!(
            roles_and_contents(&snapshot.messages),
            vec![(Role::Model, "Namaste! 🙏")]
        );
        assert_eq!(harness.session.prompts(), vec![GREETING_PROMPT.to_string()]);
        assert_eq!(
            stored_messages(&harness.storage).unwrap(),
            snapshot.messages
        );
    }

    #[tokio::test]
    async fn saved_history_is_restored_without_remote_call() {
        let storage = Arc::new(MemoryStorage::new());
        let saved = vec![Message::user("What is 2+2?"), Message::new(Role::Model, "4 ✅")];
        PersistedHistory::new(storage.clone()).save(&saved).unwrap();
        let harness = harness_with_storage(Vec::new(), true, storage);

        let outcome = harness.store.initialize().await;

        assert_eq!(outcome, InitOutcome::Restored { count: 2 });
        let snapshot = harness.store.snapshot();
        assert_eq!(snapshot.messages, saved);
        assert!(!snapshot.is_loading);
        assert!(harness.session.prompts().is_empty());
    }

    #[tokio::test]
    async fn persisted_conversation_survives_reinitialize() {
        let storage = Arc::new(MemoryStorage::new());
        let first = harness_with_storage(
            vec![
                Reply::Chunks(vec!["Namaste!"]),
                Reply::Chunks(vec!["Plants ", "make food."]),
            ],
            true,
            storage.clone(),
        );
        first.store.initialize().await;
        first.store.send_message("What is photosynthesis?").await;
        let expected = first.store.snapshot().messages;

        let second = harness_with_storage(Vec::new(), true, storage);
        second.store.initialize().await;

        assert_eq!(second.store.snapshot().messages, expected);
        assert_eq!(
            roles_and_contents(&expected),
            vec![
                (Role::Model, "Namaste!"),
                (Role::User, "What is photosynthesis?"),
                (Role::Model, "Plants make food."),
            ]
        );
    }

    #[tokio::test]
    async fn offline_start_shows_welcome_and_writes_nothing() {
        let harness = harness(Vec::new(), false);

        let outcome = harness.store.initialize().await;

        assert_eq!(outcome, InitOutcome::OfflineWelcome);
        let snapshot = harness.store.snapshot();
        assert_eq!(
            roles_and_contents(&snapshot.messages),
            vec![(Role::Error, OFFLINE_WELCOME_TEXT)]
        );
        assert!(!snapshot.is_loading);
        assert!(harness.storage.is_empty());
        assert!(harness.session.prompts().is_empty());
    }

    #[tokio::test]
    async fn corrupt_history_is_removed_and_greeting_runs() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(CHAT_HISTORY_KEY, "{definitely not json").unwrap();
        let harness = harness_with_storage(vec![Reply::Refuse], true, storage);

        let outcome = harness.store.initialize().await;

        assert_eq!(outcome, InitOutcome::Greeted(GreetingOutcome::Failed));
        assert!(harness.storage.get(CHAT_HISTORY_KEY).unwrap().is_none());
        assert_eq!(harness.session.prompts(), vec![GREETING_PROMPT.to_string()]);
    }

    #[tokio::test]
    async fn non_array_history_is_removed_like_corrupt_json() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(CHAT_HISTORY_KEY, "{}").unwrap();
        let harness = harness_with_storage(Vec::new(), false, storage);

        assert_eq!(harness.store.initialize().await, InitOutcome::OfflineWelcome);
        assert!(harness.storage.get(CHAT_HISTORY_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_greeting_leaves_single_error() {
        let harness = harness(vec![Reply::FailAfter(vec!["Nam"])], true);

        harness.store.initialize().await;

        let snapshot = harness.store.snapshot();
        assert_eq!(
            roles_and_contents(&snapshot.messages),
            vec![(Role::Error, GREETING_FAILED_TEXT)]
        );
        assert!(!snapshot.is_loading);
    }

    #[tokio::test]
    async fn initialize_runs_only_once() {
        let harness = harness(vec![Reply::Chunks(vec!["Namaste!"])], true);

        harness.store.initialize().await;
        let outcome = harness.store.initialize().await;

        assert_eq!(outcome, InitOutcome::AlreadyInitialized);
        assert_eq!(harness.session.prompts().len(), 1);
    }

    #[tokio::test]
    async fn successful_sends_grow_conversation_by_two() {
        let harness = harness(
            vec![
                Reply::Chunks(vec!["Namaste!"]),
                Reply::Chunks(vec!["Four."]),
                Reply::Chunks(vec!["Nine."]),
            ],
            true,
        );
        harness.store.initialize().await;

        for (prompt, expected_len) in [("2+2?", 3), ("3*3?", 5)] {
            let outcome = harness.store.send_message(prompt).await;
            assert_eq!(outcome, SendOutcome::Completed);
            assert_eq!(harness.store.snapshot().messages.len(), expected_len);
        }

        let snapshot = harness.store.snapshot();
        assert_eq!(
            roles_and_contents(&snapshot.messages[3..]),
            vec![(Role::User, "3*3?"), (Role::Model, "Nine.")]
        );
        assert!(!snapshot.is_loading);
        assert_eq!(
            harness.session.prompts(),
            vec![GREETING_PROMPT.to_string(), "2+2?".to_string(), "3*3?".to_string()]
        );
    }

    #[tokio::test]
    async fn offline_send_appends_one_error_without_model_call() {
        let storage = Arc::new(MemoryStorage::new());
        PersistedHistory::new(storage.clone())
            .save(&[Message::new(Role::Model, "Namaste!")])
            .unwrap();
        let harness = harness_with_storage(Vec::new(), true, storage);
        harness.store.initialize().await;
        harness.gate.set_online(false);

        let outcome = harness.store.send_message("What is photosynthesis?").await;

        assert_eq!(outcome, SendOutcome::Offline);
        let snapshot = harness.store.snapshot();
        assert_eq!(
            roles_and_contents(&snapshot.messages),
            vec![(Role::Model, "Namaste!"), (Role::Error, OFFLINE_SEND_TEXT)]
        );
        assert!(harness.session.prompts().is_empty());
        assert_eq!(stored_messages(&harness.storage).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn blank_send_is_ignored_even_offline() {
        let harness = harness(Vec::new(), false);
        harness.store.initialize().await;
        let before = harness.store.snapshot();

        assert_eq!(harness.store.send_message("   ").await, SendOutcome::EmptyInput);
        assert_eq!(harness.store.snapshot(), before);
    }

    #[tokio::test]
    async fn failed_send_swaps_placeholder_for_error() {
        let harness = harness(
            vec![Reply::Chunks(vec!["Namaste!"]), Reply::FailAfter(vec!["Part"])],
            true,
        );
        harness.store.initialize().await;

        let outcome = harness.store.send_message("Why is the sky blue?").await;

        assert_eq!(outcome, SendOutcome::Failed);
        let snapshot = harness.store.snapshot();
        assert_eq!(
            roles_and_contents(&snapshot.messages),
            vec![
                (Role::Model, "Namaste!"),
                (Role::User, "Why is the sky blue?"),
                (Role::Error, SEND_FAILED_TEXT),
            ]
        );
        assert!(!snapshot.is_loading);
        assert_eq!(
            roles_and_contents(&stored_messages(&harness.storage).unwrap()),
            vec![(Role::Model, "Namaste!"), (Role::User, "Why is the sky blue?")]
        );
    }

    #[tokio::test]
    async fn chunks_are_applied_in_order() {
        let (sender, receiver) = mpsc::unbounded();
        let harness = harness(vec![Reply::Channel(receiver)], true);
        let mut updates = harness.store.subscribe();

        let store = harness.store.clone();
        let send = tokio::spawn(async move { store.send_message("Say namaste").await });

        updates
            .wait_for(|snapshot| last_model_content(snapshot) == Some(""))
            .await
            .unwrap();
        for (chunk, expected) in [("Na", "Na"), ("mas", "Namas"), ("te", "Namaste")] {
            sender.unbounded_send(Ok(TextChunk::new(chunk))).unwrap();
            updates
                .wait_for(|snapshot| last_model_content(snapshot) == Some(expected))
                .await
                .unwrap();
        }
        drop(sender);

        assert_eq!(send.await.unwrap(), SendOutcome::Completed);
        assert_eq!(
            roles_and_contents(&harness.store.snapshot().messages),
            vec![(Role::User, "Say namaste"), (Role::Model, "Namaste")]
        );
    }

    #[tokio::test]
    async fn second_send_while_streaming_is_rejected() {
        let (sender, receiver) = mpsc::unbounded();
        let harness = harness(vec![Reply::Channel(receiver)], true);
        let mut updates = harness.store.subscribe();

        let store = harness.store.clone();
        let first = tokio::spawn(async move { store.send_message("first").await });
        updates
            .wait_for(|snapshot| snapshot.is_loading && snapshot.messages.len() == 2)
            .await
            .unwrap();
        let before = harness.store.snapshot();

        assert_eq!(harness.store.send_message("second").await, SendOutcome::Busy);
        assert_eq!(
            harness.store.fetch_greeting().await,
            GreetingOutcome::Busy
        );
        assert_eq!(harness.store.snapshot(), before);

        sender.unbounded_send(Ok(TextChunk::new("done"))).unwrap();
        drop(sender);
        assert_eq!(first.await.unwrap(), SendOutcome::Completed);
        assert_eq!(harness.session.prompts(), vec!["first".to_string()]);
        assert!(!harness.store.snapshot().is_loading);
    }

    #[tokio::test]
    async fn empty_reply_is_kept_hidden_and_not_persisted() {
        let harness = harness(
            vec![Reply::Chunks(vec!["Namaste!"]), Reply::Chunks(Vec::new())],
            true,
        );
        harness.store.initialize().await;

        assert_eq!(harness.store.send_message("hello").await, SendOutcome::Completed);

        let snapshot = harness.store.snapshot();
        assert_eq!(snapshot.messages.len(), 3);
        assert!(!snapshot.messages[2].is_renderable());
        assert_eq!(
            roles_and_contents(&stored_messages(&harness.storage).unwrap()),
            vec![(Role::Model, "Namaste!"), (Role::User, "hello")]
        );
    }

    #[tokio::test]
    async fn reconnect_retries_greeting_exactly_once() {
        let harness = harness(vec![Reply::Chunks(vec!["Namaste", "! 🙏"])], false);
        harness.store.initialize().await;
        let retry = harness.store.spawn_auto_retry();
        let mut updates = harness.store.subscribe();

        harness.gate.set_online(true);

        updates
            .wait_for(|snapshot| {
                !snapshot.is_loading && last_model_content(snapshot) == Some("Namaste! 🙏")
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(harness.session.prompts(), vec![GREETING_PROMPT.to_string()]);
        retry.abort();
    }

    #[tokio::test]
    async fn failed_retry_waits_for_next_transition() {
        let harness = harness(
            vec![Reply::Refuse, Reply::Chunks(vec!["Namaste!"])],
            false,
        );
        harness.store.initialize().await;
        let retry = harness.store.spawn_auto_retry();
        let mut updates = harness.store.subscribe();

        harness.gate.set_online(true);
        updates
            .wait_for(|snapshot| {
                !snapshot.is_loading
                    && roles_and_contents(&snapshot.messages)
                        == vec![(Role::Error, GREETING_FAILED_TEXT)]
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(harness.session.prompts().len(), 1);

        harness.gate.set_online(false);
        harness.gate.set_online(true);
        updates
            .wait_for(|snapshot| last_model_content(snapshot) == Some("Namaste!"))
            .await
            .unwrap();
        assert_eq!(harness.session.prompts().len(), 2);
        retry.abort();
    }

    #[tokio::test]
    async fn auto_retry_fires_when_gate_is_already_online() {
        let harness = harness(vec![Reply::Chunks(vec!["Namaste!"])], false);
        harness.store.initialize().await;
        harness.gate.set_online(true);
        let mut updates = harness.store.subscribe();

        let retry = harness.store.spawn_auto_retry();

        updates
            .wait_for(|snapshot| {
                !snapshot.is_loading && last_model_content(snapshot) == Some("Namaste!")
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(harness.session.prompts(), vec![GREETING_PROMPT.to_string()]);
        retry.abort();
    }

    #[tokio::test]
    async fn unchanged_persistable_messages_are_not_rewritten() {
        let (_session, storage, gate, store) = counting_store(
            vec![
                Reply::Chunks(vec!["Namaste", "!"]),
                Reply::Chunks(vec!["Leaves ", "make food."]),
            ],
            true,
        );
        store.initialize().await;
        // placeholder commit writes nothing, then one write per chunk
        assert_eq!(storage.writes(), 2);

        gate.set_online(false);
        assert_eq!(store.send_message("offline?").await, SendOutcome::Offline);
        assert_eq!(storage.writes(), 2);

        gate.set_online(true);
        assert_eq!(
            store.send_message("What is photosynthesis?").await,
            SendOutcome::Completed
        );
        // user message with placeholder, then two chunks
        assert_eq!(storage.writes(), 5);
    }

    #[tokio::test]
    async fn restored_history_is_not_written_back() {
        let (session, storage, _gate, store) = counting_store(Vec::new(), true);
        storage
            .inner
            .set(
                CHAT_HISTORY_KEY,
                &serde_json::to_string(&[Message::new(Role::Model, "Namaste!")]).unwrap(),
            )
            .unwrap();

        assert_eq!(store.initialize().await, InitOutcome::Restored { count: 1 });
        assert_eq!(storage.writes(), 0);
        assert!(session.prompts().is_empty());
    }

    #[tokio::test]
    async fn retry_ignores_healthy_conversations() {
        let harness = harness(vec![Reply::Chunks(vec!["Namaste!"])], true);
        harness.store.initialize().await;

        assert_eq!(harness.store.retry_if_stalled().await, None);
        assert_eq!(harness.session.prompts().len(), 1);
    }
}
