use serde::Serialize;

use crate::types::Message;

/// Derived reply state of a conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadState {
    pub needs_response: bool,
    pub unread_count: u32,
}

/// Derives the reply state from a message sequence ordered by `created_at`.
///
/// `needs_response` holds when the latest message is customer-authored;
/// `unread_count` counts the customer messages after the latest staff message.
/// Callers pass the whole merged history, not a single conversation row.
pub fn derive<'a, I>(messages: I) -> UnreadState
where
    I: IntoIterator<Item = &'a Message>,
    I::IntoIter: DoubleEndedIterator,
{
    let unread_count = messages
        .into_iter()
        .rev()
        .take_while(|m| m.from_customer)
        .count() as u32;

    UnreadState {
        needs_response: unread_count > 0,
        unread_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelOrigin, MessageStatus};

    fn msg(n: usize, from_customer: bool) -> Message {
        Message {
            id: format!("m{n}"),
            conversation_id: "c1".to_string(),
            body: format!("body {n}"),
            from_customer,
            channel_origin: ChannelOrigin::Web,
            external_ref: None,
            status: MessageStatus::Delivered,
            authored_by: None,
            created_at: format!("2026-01-01T00:00:{n:02}.000000Z"),
        }
    }

    #[test]
    fn empty_history_needs_nothing() {
        assert_eq!(derive(&Vec::<Message>::new()), UnreadState::default());
    }

    #[test]
    fn trailing_customer_messages_are_unread() {
        let history = vec![msg(1, true), msg(2, true)];
        assert_eq!(
            derive(&history),
            UnreadState {
                needs_response: true,
                unread_count: 2
            }
        );

        let mut answered = history.clone();
        answered.push(msg(3, false));
        assert_eq!(derive(&answered), UnreadState::default());

        answered.push(msg(4, true));
        assert_eq!(
            derive(&answered),
            UnreadState {
                needs_response: true,
                unread_count: 1
            }
        );
    }

    #[test]
    fn staff_append_always_clears_regardless_of_history() {
        let histories = [
            vec![],
            vec![msg(1, true)],
            vec![msg(1, false), msg(2, true), msg(3, true)],
        ];
        for mut history in histories {
            history.push(msg(9, false));
            assert!(!derive(&history).needs_response);
            history.push(msg(10, true));
            assert!(derive(&history).needs_response);
        }
    }
}
