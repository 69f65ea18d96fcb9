//! Conversations and append-only messages. A conversation is unique per
//! `(session_id, repo_id)`; message sequence numbers are contiguous from 1
//! and assigned while the caller holds the per-conversation lock.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{Conversation, Message, ProviderMeta, Role, ToolCallRecord};

use super::Store;

impl Store {
    /// Find the conversation for `(session_id, repo_id)`, creating it with
    /// the given title and system prompt on first use.
    pub fn find_or_create_conversation(
        &self,
        session_id: &str,
        repo_id: &str,
        title: &str,
        system_prompt: &str,
    ) -> Conversation {
        let mut conversations = self.conversations.write();

        if let Some(existing) = conversations
            .values()
            .find(|c| c.session_id == session_id && c.repo_id == repo_id)
        {
            return existing.clone();
        }

        let now = Utc::now();
        let conversation = Conversation {
            conversation_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            repo_id: repo_id.to_string(),
            title: title.to_string(),
            system_prompt: system_prompt.to_string(),
            message_count: 0,
            created_at: now,
            updated_at: now,
        };
        conversations.insert(conversation.conversation_id.clone(), conversation.clone());
        self.persist_map(&conversations, "conversations.json");
        conversation
    }

    pub fn get_conversation_for_pair(
        &self,
        session_id: &str,
        repo_id: &str,
    ) -> Option<Conversation> {
        self.conversations
            .read()
            .values()
            .find(|c| c.session_id == session_id && c.repo_id == repo_id)
            .cloned()
    }

    /// The per-conversation lock. Held by the query engine for the duration
    /// of sequence-number assignment so numbering stays contiguous.
    pub fn conversation_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.conversation_locks.lock();
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Append a message with the next sequence number. The caller must hold
    /// the conversation lock across the turn.
    pub fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: String,
        tool_calls: Option<Vec<ToolCallRecord>>,
        provider_meta: ProviderMeta,
    ) -> Message {
        let mut messages = self.messages.write();
        let list = messages.entry(conversation_id.to_string()).or_default();

        let message = Message {
            message_id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content,
            tool_calls,
            sequence_number: list.len() + 1,
            provider_meta,
            timestamp: Utc::now(),
        };
        list.push(message.clone());
        self.persist_vec(list, &format!("messages/{conversation_id}.json"));
        drop(messages);

        // Keep the conversation's message_count in step
        let mut conversations = self.conversations.write();
        if let Some(conversation) = conversations.get_mut(conversation_id) {
            conversation.message_count = message.sequence_number;
            conversation.updated_at = Utc::now();
            self.persist_map(&conversations, "conversations.json");
        }

        message
    }

    /// The last `limit` messages in ascending sequence order.
    pub fn recent_messages(&self, conversation_id: &str, limit: usize) -> Vec<Message> {
        let messages = self.messages.read();
        let Some(list) = messages.get(conversation_id) else {
            return Vec::new();
        };
        let start = list.len().saturating_sub(limit);
        list[start..].to_vec()
    }

    pub fn total_messages(&self, conversation_id: &str) -> usize {
        self.messages
            .read()
            .get(conversation_id)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}
