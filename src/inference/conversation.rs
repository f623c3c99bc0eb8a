//! Multi-round conversation state
//!
//! Tracks which messages of a model's conversation are already resident in
//! its KV cache, and decides for each incoming request whether that state
//! can be extended or has to be thrown away.
//!
//! Reuse is all or nothing: the stored messages must be a strict prefix of
//! the incoming ones (whole-message equality) and the prompt context key
//! must match. Anything else discards the record and the next prefill
//! starts at token zero.

use crate::types::message::ChatMessage;

/// Outcome of comparing an incoming request with the stored conversation
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation<'a> {
    /// KV entries that stay valid
    pub reusable_prefix_tokens: usize,
    /// Messages whose tokens still have to be prefilled
    pub messages_to_prefill: &'a [ChatMessage],
    /// Index of the first message to prefill in the incoming list
    pub prefill_from: usize,
    /// Whether the KV cache ends inside an assistant reply that the next
    /// prefill must close first
    pub continues_open_turn: bool,
    /// Whether stored state was discarded
    pub invalidated: bool,
}

#[derive(Debug, Clone)]
struct Staged {
    messages: Vec<ChatMessage>,
    context_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    messages: Vec<ChatMessage>,
    committed_tokens: usize,
    context_key: Option<String>,
    open_assistant_turn: bool,
    staged: Option<Staged>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn committed_tokens(&self) -> usize {
        self.committed_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.committed_tokens == 0
    }

    /// Decide how much of the KV cache `new_messages` can reuse.
    ///
    /// The incoming messages are staged and become the record on the next
    /// [`commit`](Self::commit).
    pub fn reconcile<'a>(&mut self, new_messages: &'a [ChatMessage], context_key: &str) -> Reconciliation<'a> {
        let reusable = match self.divergence(new_messages, context_key) {
            None => true,
            Some(reason) => {
                if !self.is_empty() {
                    tracing::debug!("Conversation state invalidated: {}", reason);
                }
                false
            }
        };

        let reconciliation = if reusable {
            let prefill_from = self.messages.len();
            Reconciliation {
                reusable_prefix_tokens: self.committed_tokens,
                messages_to_prefill: &new_messages[prefill_from..],
                prefill_from,
                continues_open_turn: self.open_assistant_turn,
                invalidated: false,
            }
        } else {
            let had_state = !self.is_empty();
            self.reset();
            Reconciliation {
                reusable_prefix_tokens: 0,
                messages_to_prefill: new_messages,
                prefill_from: 0,
                continues_open_turn: false,
                invalidated: had_state,
            }
        };

        self.staged = Some(Staged {
            messages: new_messages.to_vec(),
            context_key: context_key.to_string(),
        });
        reconciliation
    }

    /// Why the stored state cannot serve `new_messages`, if it cannot
    fn divergence(&self, new_messages: &[ChatMessage], context_key: &str) -> Option<&'static str> {
        if self.messages.is_empty() || self.committed_tokens == 0 {
            return Some("nothing cached");
        }
        if self.context_key.as_deref() != Some(context_key) {
            return Some("prompt context changed");
        }
        if new_messages.len() <= self.messages.len() {
            return Some("history is not extended");
        }
        if !self
            .messages
            .iter()
            .zip(new_messages)
            .all(|(stored, incoming)| stored.same_turn(incoming))
        {
            return Some("history edited");
        }
        None
    }

    /// Record that `tokens` tokens are now resident in the KV cache.
    ///
    /// Only called after a forward pass succeeded.
    pub fn commit(&mut self, tokens: usize) {
        if let Some(staged) = self.staged.take() {
            self.messages = staged.messages;
            self.context_key = Some(staged.context_key);
            self.open_assistant_turn = false;
        }
        self.committed_tokens = tokens;
    }

    /// Append the generated reply; its turn stays open in the KV cache
    pub fn record_reply(&mut self, reply: ChatMessage) {
        self.messages.push(reply);
        self.open_assistant_turn = true;
    }

    pub fn reset(&mut self) {
        self.messages.clear();
        self.committed_tokens = 0;
        self.context_key = None;
        self.open_assistant_turn = false;
        self.staged = None;
    }
}
