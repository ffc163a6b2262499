//! Conversation store - the reconciliation core
//!
//! Owns the authoritative in-memory message list and unread counter for one
//! support conversation, merging four producers into a single ordered,
//! deduplicated sequence: cache replay, optimistic local sends, history
//! pulls, and live push deliveries. The merge keys on message id and
//! re-sorts by (timestamp, insertion sequence), so replaying the same page
//! or delivering the same push twice is a no-op, and the display order never
//! depends on which network future happened to resolve first.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use thiserror::Error;

use crate::cache::{ChatSnapshot, SnapshotCache};
use crate::models::{Message, MessageId, MessageStatus, SenderRole};
use crate::transport::{ChatTransport, Draft, PushEvent};

/// Error from a store operation, tagged with the operation that failed.
///
/// Transport failures stay local to the operation that triggered them;
/// unrelated conversation state is never torn down on the way out.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("history fetch failed: {0:#}")]
    Fetch(anyhow::Error),
    #[error("send failed: {0:#}")]
    Send(anyhow::Error),
    #[error("mark-read failed: {0:#}")]
    MarkRead(anyhow::Error),
}

struct Entry {
    message: Message,
    /// Insertion sequence, the stable tie-break for equal timestamps.
    seq: u64,
}

#[derive(Default)]
struct ChatState {
    entries: Vec<Entry>,
    chat_id: Option<String>,
    unread_count: usize,
    /// Bumped by `clear()`; in-flight operations re-check it on resumption
    /// and discard stale results.
    generation: u64,
    next_seq: u64,
}

/// The conversation store.
///
/// Constructed with an injected cache and transport; owns its message list
/// exclusively. State transitions are synchronous critical sections under
/// the internal mutex, which is never held across an await.
pub struct ChatStore<C, T> {
    self_id: String,
    self_name: String,
    cache: C,
    transport: T,
    state: Mutex<ChatState>,
}

impl<C: SnapshotCache, T: ChatTransport> ChatStore<C, T> {
    pub fn new(
        self_id: impl Into<String>,
        self_name: impl Into<String>,
        cache: C,
        transport: T,
    ) -> Self {
        Self {
            self_id: self_id.into(),
            self_name: self_name.into(),
            cache,
            transport,
            state: Mutex::new(ChatState::default()),
        }
    }

    /// Load the cached snapshot so there is something to show before any
    /// network round trip. No network call.
    pub fn hydrate(&self) {
        let Some(snapshot) = self.cache.load() else {
            return;
        };

        let mut state = self.lock_state();
        state.entries.clear();
        state.next_seq = 0;
        state.chat_id = snapshot.chat_id;
        for message in snapshot.messages {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.push(Entry { message, seq });
        }
        sort_entries(&mut state);
        // The snapshot stores an unread count, but it is a derived view;
        // recompute rather than trust it.
        recompute_unread(&mut state, &self.self_id);
    }

    /// Pull history and merge it in. Returns the resolved chat id.
    ///
    /// Fails soft: on transport error the state is left unchanged. Safe to
    /// call repeatedly or concurrently; the merge tolerates replays.
    pub async fn refresh(&self, chat_id: Option<&str>) -> Result<String, StoreError> {
        let (generation, current_chat) = {
            let state = self.lock_state();
            (state.generation, state.chat_id.clone())
        };
        let requested = chat_id.map(str::to_owned).or(current_chat);

        let page = self
            .transport
            .fetch_history(requested.as_deref())
            .await
            .map_err(StoreError::Fetch)?;

        let mut state = self.lock_state();
        if state.generation != generation {
            tracing::debug!("Discarding history fetched before clear()");
            return Ok(page.chat_id);
        }

        if state.chat_id.as_deref().is_some_and(|id| id != page.chat_id) {
            tracing::info!("Conversation changed, rebuilding from fetched history");
            state.entries.clear();
        }
        state.chat_id = Some(page.chat_id.clone());
        merge(&mut state, page.messages);
        recompute_unread(&mut state, &self.self_id);
        self.persist(&state);

        Ok(page.chat_id)
    }

    /// Send a message: append it locally right away, then confirm with the
    /// server. On success the local entry is superseded by the canonical
    /// message; on failure it is removed and the error surfaced, so a failed
    /// send never pretends to have happened.
    pub async fn send(&self, draft: Draft) -> Result<(), StoreError> {
        let local_id = MessageId::new_local();

        let (generation, chat_id) = {
            let mut state = self.lock_state();
            let message = Message {
                id: local_id.clone(),
                chat_id: state.chat_id.clone().unwrap_or_default(),
                sender_id: self.self_id.clone(),
                sender_name: self.self_name.clone(),
                sender_role: SenderRole::Customer,
                content: draft.content.clone(),
                kind: draft.kind,
                file_url: draft.file_url.clone(),
                file_name: draft.file_name.clone(),
                file_size: draft.file_size,
                timestamp: Utc::now(),
                status: MessageStatus::Sending,
                reply_to: draft.reply_to.clone(),
            };
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.push(Entry { message, seq });
            sort_entries(&mut state);
            self.persist(&state);
            (state.generation, state.chat_id.clone())
        };

        match self.transport.post_message(chat_id.as_deref(), &draft).await {
            Ok(canonical) => {
                let mut state = self.lock_state();
                if state.generation != generation {
                    tracing::debug!("Discarding send confirmation from before clear()");
                    return Ok(());
                }
                // Supersede the placeholder. The canonical message may
                // already be present if the push channel delivered it first;
                // the merge handles that without duplicating.
                state.entries.retain(|e| e.message.id != local_id);
                if state.chat_id.is_none() && !canonical.chat_id.is_empty() {
                    state.chat_id = Some(canonical.chat_id.clone());
                }
                merge(&mut state, vec![canonical]);
                recompute_unread(&mut state, &self.self_id);
                self.persist(&state);
                Ok(())
            }
            Err(e) => {
                let mut state = self.lock_state();
                if state.generation == generation {
                    state.entries.retain(|e| e.message.id != local_id);
                    recompute_unread(&mut state, &self.self_id);
                    self.persist(&state);
                }
                Err(StoreError::Send(e))
            }
        }
    }

    /// Merge a single live delivery. Called from the push event loop; never
    /// fails. Deliveries for a foreign conversation are dropped.
    pub fn receive_push(&self, event: PushEvent) {
        let mut state = self.lock_state();
        match state.chat_id {
            Some(ref id) if *id != event.chat_id => {
                tracing::debug!("Ignoring push event for another chat ({})", event.chat_id);
                return;
            }
            None => state.chat_id = Some(event.chat_id.clone()),
            _ => {}
        }
        merge(&mut state, vec![event.message]);
        recompute_unread(&mut state, &self.self_id);
        self.persist(&state);
    }

    /// Mark one message read: confirm with the server first, then advance
    /// the local status. A failed call leaves state untouched and can simply
    /// be retried. Local-only entries have nothing to confirm.
    pub async fn mark_read(&self, id: &MessageId) -> Result<(), StoreError> {
        let generation = self.lock_state().generation;

        if let MessageId::Canonical(canonical) = id {
            self.transport
                .mark_read(canonical)
                .await
                .map_err(StoreError::MarkRead)?;
        }

        let mut state = self.lock_state();
        if state.generation != generation {
            return Ok(());
        }
        if let Some(entry) = state.entries.iter_mut().find(|e| e.message.id == *id) {
            entry.message.advance_status(MessageStatus::Read);
        }
        recompute_unread(&mut state, &self.self_id);
        self.persist(&state);
        Ok(())
    }

    /// Mark the whole conversation read. Own messages are untouched; their
    /// read state belongs to the counterpart.
    pub async fn mark_all_read(&self) -> Result<(), StoreError> {
        let generation = self.lock_state().generation;

        self.transport
            .mark_all_read()
            .await
            .map_err(StoreError::MarkRead)?;

        let mut state = self.lock_state();
        if state.generation != generation {
            return Ok(());
        }
        for entry in state.entries.iter_mut() {
            if entry.message.sender_id != self.self_id {
                entry.message.advance_status(MessageStatus::Read);
            }
        }
        recompute_unread(&mut state, &self.self_id);
        self.persist(&state);
        Ok(())
    }

    /// Wipe state and cache (e.g. on logout). Bumps the generation so
    /// anything still in flight discards its result instead of resurrecting
    /// data for a different identity.
    pub fn clear(&self) {
        let mut state = self.lock_state();
        state.generation += 1;
        state.entries.clear();
        state.chat_id = None;
        state.unread_count = 0;
        self.cache.save(ChatSnapshot::default());
    }

    /// Current message list in display order.
    pub fn messages(&self) -> Vec<Message> {
        self.lock_state()
            .entries
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    /// Count of unread messages from the counterpart.
    pub fn unread_count(&self) -> usize {
        self.lock_state().unread_count
    }

    /// The adopted conversation id, if any.
    pub fn chat_id(&self) -> Option<String> {
        self.lock_state().chat_id.clone()
    }

    fn persist(&self, state: &ChatState) {
        self.cache.save(ChatSnapshot {
            messages: state.entries.iter().map(|e| e.message.clone()).collect(),
            chat_id: state.chat_id.clone(),
            unread_count: state.unread_count,
        });
    }

    fn lock_state(&self) -> MutexGuard<'_, ChatState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Merge incoming messages into the current state.
///
/// Known ids only ever advance their status (`max` along the status order);
/// everything else about a message is immutable after creation. Unknown ids
/// are admitted with a fresh insertion sequence. Entries in the local id
/// namespace are never evicted here; only a send confirmation supersedes
/// them.
fn merge(state: &mut ChatState, incoming: Vec<Message>) {
    let mut index: HashMap<MessageId, usize> = state
        .entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.message.id.clone(), i))
        .collect();

    for message in incoming {
        match index.get(&message.id) {
            Some(&i) => state.entries[i].message.advance_status(message.status),
            None => {
                let seq = state.next_seq;
                state.next_seq += 1;
                index.insert(message.id.clone(), state.entries.len());
                state.entries.push(Entry { message, seq });
            }
        }
    }

    sort_entries(state);
}

fn sort_entries(state: &mut ChatState) {
    state.entries.sort_by(|a, b| {
        a.message
            .timestamp
            .cmp(&b.message.timestamp)
            .then(a.seq.cmp(&b.seq))
    });
}

fn recompute_unread(state: &mut ChatState, self_id: &str) {
    state.unread_count = state
        .entries
        .iter()
        .filter(|e| e.message.sender_id != self_id && e.message.status != MessageStatus::Read)
        .count();
}
