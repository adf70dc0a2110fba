use shared::{
    domain::UserId,
    protocol::{ChatSummary, Page},
};
use tokio::sync::Mutex;

use crate::ListStatus;

/// One known interlocutor. Unique per id within the directory; at most one
/// entry is open at any time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub interlocutor_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub has_unread: bool,
    pub is_open: bool,
    /// Logical-clock stamp of the last local flag mutation; lets a reload
    /// keep a flag that changed while the listing request was in flight.
    pub(crate) touched_at: u64,
}

impl Conversation {
    pub fn from_summary(summary: ChatSummary) -> Self {
        Self {
            interlocutor_id: summary.user_id,
            display_name: summary.name,
            avatar_url: summary.avatar,
            has_unread: summary.has_unread_messages,
            is_open: false,
            touched_at: 0,
        }
    }

    /// Entry for an interlocutor first observed over the socket, before the
    /// next directory reload fills in the profile fields.
    pub fn placeholder(interlocutor_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            interlocutor_id,
            display_name: display_name.into(),
            avatar_url: None,
            has_unread: false,
            is_open: false,
            touched_at: 0,
        }
    }
}

#[derive(Debug, Default)]
struct DirectoryState {
    status: ListStatus,
    next: Option<String>,
    entries: Vec<Conversation>,
    open_id: Option<UserId>,
    clock: u64,
}

impl DirectoryState {
    fn stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn entry_mut(&mut self, id: UserId) -> Option<&mut Conversation> {
        self.entries
            .iter_mut()
            .find(|entry| entry.interlocutor_id == id)
    }

    fn adopt(&self, summary: ChatSummary, snapshot: u64) -> Conversation {
        let mut entry = Conversation::from_summary(summary);
        if let Some(previous) = self
            .entries
            .iter()
            .find(|e| e.interlocutor_id == entry.interlocutor_id)
        {
            // A flag mutated after the listing request started is newer than
            // the listing itself; keep the local value.
            if previous.touched_at > snapshot {
                entry.has_unread = previous.has_unread;
                entry.touched_at = previous.touched_at;
            }
        }
        entry.is_open = self.open_id == Some(entry.interlocutor_id);
        entry
    }
}

/// The ordered list of known interlocutors with their unread/open flags.
/// Backend-sourced on (re)load; flag operations are idempotent.
#[derive(Default)]
pub struct Directory {
    state: Mutex<DirectoryState>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn status(&self) -> ListStatus {
        self.state.lock().await.status
    }

    pub async fn entries(&self) -> Vec<Conversation> {
        self.state.lock().await.entries.clone()
    }

    pub async fn open_id(&self) -> Option<UserId> {
        self.state.lock().await.open_id
    }

    pub async fn contains(&self, id: UserId) -> bool {
        self.state
            .lock()
            .await
            .entries
            .iter()
            .any(|entry| entry.interlocutor_id == id)
    }

    pub async fn next_cursor(&self) -> Option<String> {
        self.state.lock().await.next.clone()
    }

    /// Marks the listing as loading and returns the clock snapshot the
    /// matching [`complete_load`](Self::complete_load) must reconcile against.
    pub async fn begin_load(&self) -> u64 {
        let mut state = self.state.lock().await;
        state.status = ListStatus::Loading;
        state.clock
    }

    /// Replaces the directory with a fresh backend listing, keeping the open
    /// id if still present and any unread flag mutated after `snapshot`.
    pub async fn complete_load(&self, page: Page<ChatSummary>, snapshot: u64) {
        let mut state = self.state.lock().await;
        let entries = page
            .results
            .into_iter()
            .map(|summary| state.adopt(summary, snapshot))
            .collect();
        state.entries = entries;
        state.next = page.next;
        state.status = ListStatus::Loaded;
    }

    /// Appends the next listing page; ids already present are skipped.
    pub async fn complete_next_page(&self, page: Page<ChatSummary>, snapshot: u64) {
        let mut state = self.state.lock().await;
        for summary in page.results {
            if state
                .entries
                .iter()
                .any(|entry| entry.interlocutor_id == summary.user_id)
            {
                continue;
            }
            let entry = state.adopt(summary, snapshot);
            state.entries.push(entry);
        }
        state.next = page.next;
        state.status = ListStatus::Loaded;
    }

    pub async fn fail_load(&self) {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.next = None;
        state.status = ListStatus::Error;
    }

    /// Exclusive: after the call exactly one entry is open, or zero if `id`
    /// is not (yet) in the directory. The open id is remembered either way so
    /// a later reload can restore the flag.
    pub async fn set_open(&self, id: UserId) {
        let mut state = self.state.lock().await;
        state.open_id = Some(id);
        for entry in &mut state.entries {
            entry.is_open = entry.interlocutor_id == id;
        }
    }

    pub async fn clear_open(&self) {
        let mut state = self.state.lock().await;
        state.open_id = None;
        for entry in &mut state.entries {
            entry.is_open = false;
        }
    }

    pub async fn mark_read(&self, id: UserId) {
        let mut state = self.state.lock().await;
        let stamp = state.stamp();
        if let Some(entry) = state.entry_mut(id) {
            entry.has_unread = false;
            entry.touched_at = stamp;
        }
    }

    pub async fn mark_unread(&self, id: UserId) {
        let mut state = self.state.lock().await;
        let stamp = state.stamp();
        if let Some(entry) = state.entry_mut(id) {
            entry.has_unread = true;
            entry.touched_at = stamp;
        }
    }

    /// Makes a socket-observed interlocutor visible before the next full
    /// reload; a no-op when the id is already present.
    pub async fn append(&self, entry: Conversation) {
        let mut state = self.state.lock().await;
        if state
            .entries
            .iter()
            .any(|existing| existing.interlocutor_id == entry.interlocutor_id)
        {
            return;
        }
        let mut entry = entry;
        entry.is_open = state.open_id == Some(entry.interlocutor_id);
        state.entries.push(entry);
    }

    pub async fn reset(&self) {
        *self.state.lock().await = DirectoryState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: i64, name: &str, unread: bool) -> ChatSummary {
        ChatSummary {
            user_id: UserId(id),
            name: name.to_string(),
            avatar: None,
            has_unread_messages: unread,
        }
    }

    fn page(results: Vec<ChatSummary>, next: Option<&str>) -> Page<ChatSummary> {
        Page {
            count: Some(results.len() as i64),
            next: next.map(str::to_string),
            previous: None,
            results,
        }
    }

    #[tokio::test]
    async fn load_replaces_entries_and_preserves_open_id() {
        let directory = Directory::new();
        let snapshot = directory.begin_load().await;
        directory
            .complete_load(page(vec![summary(7, "alice", false)], None), snapshot)
            .await;
        directory.set_open(UserId(7)).await;

        let snapshot = directory.begin_load().await;
        directory
            .complete_load(
                page(
                    vec![summary(9, "bob", true), summary(7, "alice", false)],
                    None,
                ),
                snapshot,
            )
            .await;

        let entries = directory.entries().await;
        assert_eq!(entries.len(), 2);
        let alice = entries
            .iter()
            .find(|e| e.interlocutor_id == UserId(7))
            .expect("alice");
        assert!(alice.is_open);
        assert_eq!(directory.open_id().await, Some(UserId(7)));
        assert_eq!(directory.status().await, ListStatus::Loaded);
    }

    #[tokio::test]
    async fn set_open_is_exclusive_and_tolerates_absent_ids() {
        let directory = Directory::new();
        let snapshot = directory.begin_load().await;
        directory
            .complete_load(
                page(
                    vec![summary(7, "alice", false), summary(9, "bob", false)],
                    None,
                ),
                snapshot,
            )
            .await;

        directory.set_open(UserId(7)).await;
        directory.set_open(UserId(9)).await;
        let open: Vec<_> = directory
            .entries()
            .await
            .into_iter()
            .filter(|e| e.is_open)
            .collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].interlocutor_id, UserId(9));

        // Absent id: zero entries open, but the id is remembered for reload.
        directory.set_open(UserId(42)).await;
        assert!(directory.entries().await.iter().all(|e| !e.is_open));
        assert_eq!(directory.open_id().await, Some(UserId(42)));
    }

    #[tokio::test]
    async fn unread_flags_are_idempotent_and_ignore_unknown_ids() {
        let directory = Directory::new();
        let snapshot = directory.begin_load().await;
        directory
            .complete_load(page(vec![summary(7, "alice", false)], None), snapshot)
            .await;

        directory.mark_unread(UserId(7)).await;
        let once = directory.entries().await;
        directory.mark_unread(UserId(7)).await;
        let twice = directory.entries().await;
        assert_eq!(once[0].has_unread, twice[0].has_unread);
        assert!(twice[0].has_unread);

        directory.mark_read(UserId(7)).await;
        directory.mark_read(UserId(7)).await;
        assert!(!directory.entries().await[0].has_unread);

        // Unknown ids are a no-op, not a panic.
        directory.mark_unread(UserId(99)).await;
        assert_eq!(directory.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn reload_keeps_flags_mutated_while_the_listing_was_in_flight() {
        let directory = Directory::new();
        let snapshot = directory.begin_load().await;
        directory
            .complete_load(page(vec![summary(7, "alice", false)], None), snapshot)
            .await;

        // A reload starts, and while it is in flight the socket marks the
        // conversation unread. The listing response (snapshotted before the
        // mutation) must not overwrite the newer local flag.
        let stale_snapshot = directory.begin_load().await;
        directory.mark_unread(UserId(7)).await;
        directory
            .complete_load(page(vec![summary(7, "alice", false)], None), stale_snapshot)
            .await;
        assert!(directory.entries().await[0].has_unread);

        // A listing fetched after the mutation wins again.
        let fresh_snapshot = directory.begin_load().await;
        directory
            .complete_load(page(vec![summary(7, "alice", false)], None), fresh_snapshot)
            .await;
        assert!(!directory.entries().await[0].has_unread);
    }

    #[tokio::test]
    async fn next_page_appends_without_duplicating_ids() {
        let directory = Directory::new();
        let snapshot = directory.begin_load().await;
        directory
            .complete_load(
                page(vec![summary(7, "alice", false)], Some("http://next/page2")),
                snapshot,
            )
            .await;

        let snapshot = directory.begin_load().await;
        directory
            .complete_next_page(
                page(
                    vec![summary(7, "alice", false), summary(9, "bob", true)],
                    None,
                ),
                snapshot,
            )
            .await;

        let entries = directory.entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(directory.next_cursor().await, None);
    }

    #[tokio::test]
    async fn append_makes_new_interlocutors_visible_once() {
        let directory = Directory::new();
        directory
            .append(Conversation::placeholder(UserId(9), "bob"))
            .await;
        directory
            .append(Conversation::placeholder(UserId(9), "bob"))
            .await;
        assert_eq!(directory.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_load_clears_entries_and_reports_error() {
        let directory = Directory::new();
        let snapshot = directory.begin_load().await;
        directory
            .complete_load(page(vec![summary(7, "alice", false)], None), snapshot)
            .await;

        directory.begin_load().await;
        directory.fail_load().await;
        assert!(directory.entries().await.is_empty());
        assert_eq!(directory.status().await, ListStatus::Error);
    }
}
