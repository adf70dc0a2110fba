use std::collections::HashSet;

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, UserId},
    protocol::{ChatMessageDto, NewMessageData, Page},
};
use tokio::sync::Mutex;

use crate::ListStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub sender_id: UserId,
}

impl From<ChatMessageDto> for ChatMessage {
    fn from(dto: ChatMessageDto) -> Self {
        Self {
            id: dto.id,
            text: dto.text,
            created_at: dto.created_at,
            sender_id: dto.user,
        }
    }
}

impl ChatMessage {
    pub fn from_realtime(data: &NewMessageData) -> Self {
        Self {
            id: data.message_id,
            text: data.message_text.clone(),
            created_at: data.created_at,
            sender_id: data.author.id,
        }
    }
}

#[derive(Debug, Default)]
struct HistoryState {
    status: ListStatus,
    interlocutor: Option<UserId>,
    next: Option<String>,
    /// Newest first, matching the backend's ordering.
    items: Vec<ChatMessage>,
    seen: HashSet<MessageId>,
}

/// Paginated message list for the conversation currently being viewed.
/// Completions are tagged with the interlocutor they were fetched for, so a
/// stale response for a conversation the viewer has already left is dropped
/// instead of overwriting the visible one.
#[derive(Default)]
pub struct History {
    state: Mutex<HistoryState>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn status(&self) -> ListStatus {
        self.state.lock().await.status
    }

    pub async fn interlocutor(&self) -> Option<UserId> {
        self.state.lock().await.interlocutor
    }

    pub async fn items(&self) -> Vec<ChatMessage> {
        self.state.lock().await.items.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.items.is_empty()
    }

    pub async fn next_cursor(&self) -> Option<String> {
        self.state.lock().await.next.clone()
    }

    /// Switches the store to `interlocutor` and clears the previous list.
    pub async fn begin_load(&self, interlocutor: UserId) {
        let mut state = self.state.lock().await;
        state.interlocutor = Some(interlocutor);
        state.items.clear();
        state.seen.clear();
        state.next = None;
        state.status = ListStatus::Loading;
    }

    pub async fn complete_load(&self, interlocutor: UserId, page: Page<ChatMessageDto>) {
        let mut state = self.state.lock().await;
        if state.interlocutor != Some(interlocutor) {
            return;
        }
        state.items.clear();
        state.seen.clear();
        for dto in page.results {
            let message = ChatMessage::from(dto);
            if state.seen.insert(message.id) {
                state.items.push(message);
            }
        }
        state.next = page.next;
        state.status = ListStatus::Loaded;
    }

    /// Appends the next (older) page. Ids already present are skipped, so an
    /// overlapping page never duplicates a message.
    pub async fn complete_next_page(&self, interlocutor: UserId, page: Page<ChatMessageDto>) {
        let mut state = self.state.lock().await;
        if state.interlocutor != Some(interlocutor) {
            return;
        }
        for dto in page.results {
            let message = ChatMessage::from(dto);
            if state.seen.insert(message.id) {
                state.items.push(message);
            }
        }
        state.next = page.next;
        state.status = ListStatus::Loaded;
    }

    pub async fn fail_load(&self, interlocutor: UserId) {
        let mut state = self.state.lock().await;
        if state.interlocutor != Some(interlocutor) {
            return;
        }
        state.items.clear();
        state.seen.clear();
        state.next = None;
        state.status = ListStatus::Error;
    }

    /// Inserts one realtime message without touching the pagination cursor.
    /// Duplicate ids are dropped; insertion is ordered by `created_at` so a
    /// frame arriving late still lands in the right place. Returns whether
    /// the list changed.
    pub async fn append_realtime(&self, message: ChatMessage) -> bool {
        let mut state = self.state.lock().await;
        if !state.seen.insert(message.id) {
            return false;
        }
        let position = state
            .items
            .iter()
            .position(|existing| existing.created_at <= message.created_at)
            .unwrap_or(state.items.len());
        state.items.insert(position, message);
        true
    }

    pub async fn reset(&self) {
        *self.state.lock().await = HistoryState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dto(id: i64, text: &str, created_at: &str) -> ChatMessageDto {
        ChatMessageDto {
            id: MessageId(id),
            text: text.to_string(),
            created_at: created_at.parse().expect("timestamp"),
            user: UserId(7),
            chat: None,
        }
    }

    fn page(results: Vec<ChatMessageDto>, next: Option<&str>) -> Page<ChatMessageDto> {
        Page {
            count: None,
            next: next.map(str::to_string),
            previous: None,
            results,
        }
    }

    fn realtime(id: i64, created_at: &str) -> ChatMessage {
        ChatMessage {
            id: MessageId(id),
            text: format!("msg-{id}"),
            created_at: created_at.parse().expect("timestamp"),
            sender_id: UserId(7),
        }
    }

    #[tokio::test]
    async fn pagination_round_trip_has_no_duplicate_ids() {
        let history = History::new();
        history.begin_load(UserId(7)).await;
        history
            .complete_load(
                UserId(7),
                page(
                    vec![
                        dto(3, "newest", "2024-05-01T10:03:00Z"),
                        dto(2, "older", "2024-05-01T10:02:00Z"),
                    ],
                    Some("http://next/page2"),
                ),
            )
            .await;

        // The second page overlaps the first by one message.
        history
            .complete_next_page(
                UserId(7),
                page(
                    vec![
                        dto(2, "older", "2024-05-01T10:02:00Z"),
                        dto(1, "oldest", "2024-05-01T10:01:00Z"),
                    ],
                    None,
                ),
            )
            .await;

        let items = history.items().await;
        assert_eq!(items.len(), 3);
        let ids: Vec<i64> = items.iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![3, 2, 1]);
        assert_eq!(history.next_cursor().await, None);
        assert_eq!(history.status().await, ListStatus::Loaded);
    }

    #[tokio::test]
    async fn realtime_messages_prepend_and_deduplicate() {
        let history = History::new();
        history.begin_load(UserId(7)).await;
        history
            .complete_load(
                UserId(7),
                page(vec![dto(1, "old", "2024-05-01T10:00:00Z")], None),
            )
            .await;

        assert!(
            history
                .append_realtime(realtime(101, "2024-05-01T10:05:00Z"))
                .await
        );
        assert!(
            !history
                .append_realtime(realtime(101, "2024-05-01T10:05:00Z"))
                .await
        );

        let items = history.items().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, MessageId(101));
    }

    #[tokio::test]
    async fn late_realtime_message_lands_by_timestamp_not_arrival_order() {
        let history = History::new();
        history.begin_load(UserId(7)).await;
        history.complete_load(UserId(7), page(vec![], None)).await;

        history
            .append_realtime(realtime(102, "2024-05-01T10:06:00Z"))
            .await;
        // Arrives second but was created first.
        history
            .append_realtime(realtime(101, "2024-05-01T10:05:00Z"))
            .await;

        let ids: Vec<i64> = history.items().await.iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![102, 101]);
    }

    #[tokio::test]
    async fn stale_completion_for_a_left_conversation_is_dropped() {
        let history = History::new();
        history.begin_load(UserId(7)).await;
        history.begin_load(UserId(9)).await;

        // The response for the conversation the viewer already left.
        history
            .complete_load(
                UserId(7),
                page(vec![dto(1, "stale", "2024-05-01T10:00:00Z")], None),
            )
            .await;
        assert!(history.is_empty().await);
        assert_eq!(history.interlocutor().await, Some(UserId(9)));
        assert_eq!(history.status().await, ListStatus::Loading);
    }

    #[tokio::test]
    async fn failed_load_clears_items_and_reports_error() {
        let history = History::new();
        history.begin_load(UserId(7)).await;
        history
            .complete_load(
                UserId(7),
                page(vec![dto(1, "old", "2024-05-01T10:00:00Z")], None),
            )
            .await;

        history.begin_load(UserId(7)).await;
        history.fail_load(UserId(7)).await;
        assert!(history.is_empty().await);
        assert_eq!(history.status().await, ListStatus::Error);
    }
}
