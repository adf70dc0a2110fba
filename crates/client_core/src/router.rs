use shared::{domain::UserId, protocol::NewMessageData};

use crate::{directory::Conversation, history::ChatMessage};

/// Store command produced for one inbound `new_message` envelope. Commands
/// travel through a single ordered channel, so store mutations happen in
/// envelope-arrival order no matter which task observed the frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCommand {
    /// The message belongs to the open conversation: emit the read receipt,
    /// then append to history, then mark the directory entry read.
    Deliver {
        message: ChatMessage,
        receipt_to: UserId,
    },
    /// Known interlocutor, conversation not open: flag it unread.
    MarkUnread(UserId),
    /// Unknown interlocutor: show a placeholder entry right away, then
    /// reload the directory listing to pick up the real conversation.
    ReloadDirectory { announce: Conversation },
}

/// The single decision point for inbound chat messages. Pure: the caller
/// supplies the viewer identity, the open conversation (if any) and whether
/// the author is already in the directory.
///
/// A message from the open interlocutor and a self-echo of the viewer's own
/// send are treated the same, so replies and just-sent messages flow into the
/// open history uniformly. A self-echo with no open conversation has no
/// effect.
pub fn decide(
    viewer: UserId,
    open_id: Option<UserId>,
    author_known: bool,
    event: &NewMessageData,
) -> Option<StoreCommand> {
    let author = event.author.id;

    if let Some(open) = open_id {
        if author == open || author == viewer {
            return Some(StoreCommand::Deliver {
                message: ChatMessage::from_realtime(event),
                receipt_to: open,
            });
        }
    }

    if author == viewer {
        return None;
    }

    if author_known {
        Some(StoreCommand::MarkUnread(author))
    } else {
        let display_name = event
            .author
            .username
            .clone()
            .unwrap_or_else(|| format!("user {}", author.0));
        Some(StoreCommand::ReloadDirectory {
            announce: Conversation::placeholder(author, display_name),
        })
    }
}
