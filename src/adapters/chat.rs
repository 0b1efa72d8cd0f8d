//! Chat bridge boundary.
//!
//! The engines append proposal cards and system notes to the chat room
//! between buyer and seller; they never own message storage. The read side
//! is limited to the latest status a proposal message carries, which is what
//! the clients render on the card.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::{ChatMessage, MessageKind, ProposalStatus};
use crate::error::Result;

#[async_trait]
pub trait ChatBridge: Send + Sync {
    /// Find or create the room for (listing, buyer).
    async fn ensure_room(&self, listing_id: i64, buyer_id: i64, seller_id: i64) -> Result<i64>;

    async fn append_message(
        &self,
        room_id: i64,
        sender_id: i64,
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> Result<i64>;

    /// Latest status carried by a message about the given proposal, if any.
    async fn latest_proposal_status(
        &self,
        room_id: i64,
        proposal_id: i64,
    ) -> Result<Option<ProposalStatus>>;
}

/// Postgres-backed bridge over the marketplace's chat tables.
#[derive(Clone)]
pub struct PostgresChatBridge {
    pool: PgPool,
}

impl PostgresChatBridge {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatBridge for PostgresChatBridge {
    async fn ensure_room(&self, listing_id: i64, buyer_id: i64, seller_id: i64) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO chat_rooms (listing_id, buyer_id, seller_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (listing_id, buyer_id) DO UPDATE SET seller_id = EXCLUDED.seller_id
            RETURNING id
            "#,
        )
        .bind(listing_id)
        .bind(buyer_id)
        .bind(seller_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    async fn append_message(
        &self,
        room_id: i64,
        sender_id: i64,
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO chat_messages (room_id, sender_id, kind, payload)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(room_id)
        .bind(sender_id)
        .bind(kind.as_str())
        .bind(&payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    async fn latest_proposal_status(
        &self,
        room_id: i64,
        proposal_id: i64,
    ) -> Result<Option<ProposalStatus>> {
        let row = sqlx::query(
            r#"
            SELECT payload->>'status' AS status
            FROM chat_messages
            WHERE room_id = $1
              AND (payload->>'proposal_id')::BIGINT = $2
              AND payload->>'status' IS NOT NULL
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(room_id)
        .bind(proposal_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .and_then(|r| r.try_get::<String, _>("status").ok())
            .and_then(|s| ProposalStatus::try_from(s.as_str()).ok()))
    }
}

#[derive(Default)]
struct MemoryChatState {
    /// (listing_id, buyer_id) -> room id
    rooms: HashMap<(i64, i64), i64>,
    messages: Vec<ChatMessage>,
    next_room_id: i64,
    next_message_id: i64,
}

/// In-process bridge for dry-run sessions and tests.
#[derive(Default)]
pub struct MemoryChatBridge {
    state: Mutex<MemoryChatState>,
}

impl MemoryChatBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages_in_room(&self, room_id: i64) -> Vec<ChatMessage> {
        self.state
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ChatBridge for MemoryChatBridge {
    async fn ensure_room(&self, listing_id: i64, buyer_id: i64, _seller_id: i64) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        if let Some(room_id) = state.rooms.get(&(listing_id, buyer_id)) {
            return Ok(*room_id);
        }
        state.next_room_id += 1;
        let room_id = state.next_room_id;
        state.rooms.insert((listing_id, buyer_id), room_id);
        Ok(room_id)
    }

    async fn append_message(
        &self,
        room_id: i64,
        sender_id: i64,
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        state.next_message_id += 1;
        let id = state.next_message_id;
        state.messages.push(ChatMessage {
            id,
            room_id,
            sender_id,
            kind,
            payload,
            created_at: chrono::Utc::now(),
        });
        Ok(id)
    }

    async fn latest_proposal_status(
        &self,
        room_id: i64,
        proposal_id: i64,
    ) -> Result<Option<ProposalStatus>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .messages
            .iter()
            .rev()
            .filter(|m| m.room_id == room_id)
            .find(|m| m.payload["proposal_id"].as_i64() == Some(proposal_id))
            .and_then(|m| m.payload["status"].as_str().map(str::to_string))
            .and_then(|s| ProposalStatus::try_from(s.as_str()).ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_ensure_room_is_idempotent() {
        let bridge = MemoryChatBridge::new();
        let first = bridge.ensure_room(1, 3, 10).await.unwrap();
        let second = bridge.ensure_room(1, 3, 10).await.unwrap();
        assert_eq!(first, second);

        let other_buyer = bridge.ensure_room(1, 4, 10).await.unwrap();
        assert_ne!(first, other_buyer);
    }

    #[tokio::test]
    async fn test_latest_proposal_status_reads_newest() {
        let bridge = MemoryChatBridge::new();
        let room = bridge.ensure_room(1, 3, 10).await.unwrap();
        bridge
            .append_message(room, 3, MessageKind::Proposal, json!({"proposal_id": 7, "status": "pending"}))
            .await
            .unwrap();
        bridge
            .append_message(room, 10, MessageKind::System, json!({"proposal_id": 7, "status": "accepted"}))
            .await
            .unwrap();

        let status = bridge.latest_proposal_status(room, 7).await.unwrap();
        assert_eq!(status, Some(ProposalStatus::Accepted));
        assert_eq!(bridge.latest_proposal_status(room, 99).await.unwrap(), None);
    }
}
