//! History formatting for the direct reason-act loop.

use crate::gateway::ChatMessage;
use crate::message::MessageRole;
use crate::storage::ArchivedMessage;

/// Shape archived history for the model: collapse runs of consecutive
/// same-role messages (joining their contents), then keep only the most
/// recent `max_messages`.
///
/// The archive's unique key already prevents stored duplicates; this pass
/// handles the read side, where retries or reconnects can still leave
/// same-role runs.
#[must_use]
pub fn format_history(messages: &[ArchivedMessage], max_messages: usize) -> Vec<ChatMessage> {
    let mut collapsed: Vec<(MessageRole, String)> = Vec::new();
    for message in messages {
        match collapsed.last_mut() {
            Some((role, content)) if *role == message.role => {
                if *content != message.content {
                    content.push_str("\n\n");
                    content.push_str(&message.content);
                }
            }
            _ => collapsed.push((message.role, message.content.clone())),
        }
    }
    let skip = collapsed.len().saturating_sub(max_messages);
    collapsed
        .into_iter()
        .skip(skip)
        .map(|(role, content)| match role {
            MessageRole::User => ChatMessage::user(content),
            MessageRole::Model => ChatMessage::assistant(content),
        })
        .collect()
}
