//! Decides what an inbound message does to the view: bump the unread badge,
//! append and scroll, or merge silently.

use campus_shared::UserId;

/// What the user is looking at right now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewState {
    /// Counterparty of the open conversation.
    pub active: Option<UserId>,
    /// Whether the open conversation has focus.
    pub focused: bool,
}

impl ViewState {
    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_focused_on(&self, counterparty: &UserId) -> bool {
        self.focused && self.active.as_ref() == Some(counterparty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Not the open conversation: count it as unread.
    MarkUnread,
    /// Open and focused: append, scroll to it, mark it read.
    AppendAndScroll,
    /// Open but not focused: append without marking read.
    MergeSilently,
}

/// Increment unread for `sender` iff NOT (a conversation is open AND its
/// counterparty is `sender`).
pub fn should_mark_unread(is_open: bool, active: Option<&UserId>, sender: &UserId) -> bool {
    !(is_open && active == Some(sender))
}

pub fn disposition(view: &ViewState, sender: &UserId) -> Disposition {
    if should_mark_unread(view.is_open(), view.active.as_ref(), sender) {
        Disposition::MarkUnread
    } else if view.focused {
        Disposition::AppendAndScroll
    } else {
        Disposition::MergeSilently
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_conversation_with_sender_is_not_unread() {
        let bob = UserId::from("bob");
        assert!(!should_mark_unread(true, Some(&bob), &bob));
    }

    #[test]
    fn open_conversation_with_someone_else_is_unread() {
        let bob = UserId::from("bob");
        let carol = UserId::from("carol");
        assert!(should_mark_unread(true, Some(&bob), &carol));
    }

    #[test]
    fn nothing_open_is_unread() {
        assert!(should_mark_unread(false, None, &UserId::from("bob")));
    }

    #[test]
    fn closed_flag_wins_over_stale_active_id() {
        let bob = UserId::from("bob");
        assert!(should_mark_unread(false, Some(&bob), &bob));
    }

    #[test]
    fn disposition_follows_focus() {
        let bob = UserId::from("bob");
        let mut view = ViewState {
            active: Some(bob.clone()),
            focused: true,
        };
        assert_eq!(disposition(&view, &bob), Disposition::AppendAndScroll);
        assert!(view.is_focused_on(&bob));

        view.focused = false;
        assert_eq!(disposition(&view, &bob), Disposition::MergeSilently);
        assert_eq!(
            disposition(&view, &UserId::from("carol")),
            Disposition::MarkUnread
        );
        assert_eq!(
            disposition(&ViewState::default(), &bob),
            Disposition::MarkUnread
        );
    }
}
