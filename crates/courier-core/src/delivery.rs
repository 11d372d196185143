//! Delivery State Machine: per-message and per-member status tracking.
//!
//! Direct messages carry one [`StatusCell`]. Group messages carry a
//! message-level cell (acknowledged/failed by the relay) plus one receipt row
//! per notified member in a [`ReceiptIndex`]. The status the sender sees for a
//! group message is never stored; it is folded from the rows on read
//! ([`aggregate_status`]).
//!
//! # Outcomes
//!
//! [`DeliveryStateMachine::advance`] returns the notifications an accepted
//! transition produces. A stale update returns no notifications and is not an
//! error, so duplicated and reordered events converge on the same state.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    error::CoreError,
    ids::{MessageId, Timestamp, UserId},
    message::{Message, Target},
    status::{Advance, DeliveryStatus, Receipt, StatusCell, aggregate_status},
};

/// Status every member's receipt row starts in.
pub const INITIAL_RECEIPT_STATUS: DeliveryStatus = DeliveryStatus::Sent;

#[derive(Debug, Clone)]
struct ReceiptRow {
    seq: u64,
    cell: StatusCell,
}

/// Group receipts keyed by `(message, member)`.
///
/// Rows keep their insertion order per message, so exported receipt lists are
/// stable across runs.
#[derive(Debug, Clone, Default)]
pub struct ReceiptIndex {
    rows: HashMap<(MessageId, UserId), ReceiptRow>,
    order: BTreeMap<(MessageId, u64), UserId>,
    next_seq: u64,
}

impl ReceiptIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a row for `member`. Returns false (and changes nothing) if the row
    /// exists.
    pub fn insert(&mut self, message_id: &MessageId, member: &UserId, cell: StatusCell) -> bool {
        let key = (message_id.clone(), member.clone());
        if self.rows.contains_key(&key) {
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.rows.insert(key, ReceiptRow { seq, cell });
        self.order.insert((message_id.clone(), seq), member.clone());
        true
    }

    /// `member`'s cell for a message.
    pub fn get(&self, message_id: &MessageId, member: &UserId) -> Option<StatusCell> {
        self.rows.get(&(message_id.clone(), member.clone())).map(|row| row.cell)
    }

    /// Offer `status` to `member`'s row. `None` if there is no such row.
    pub fn advance(
        &mut self,
        message_id: &MessageId,
        member: &UserId,
        status: DeliveryStatus,
        at: Timestamp,
    ) -> Option<Advance> {
        let row = self.rows.get_mut(&(message_id.clone(), member.clone()))?;
        Some(row.cell.advance(status, at))
    }

    /// Members with a row for the message, in insertion order.
    pub fn members<'a>(&'a self, message_id: &'a MessageId) -> impl Iterator<Item = &'a UserId> {
        self.order
            .range((message_id.clone(), 0)..=(message_id.clone(), u64::MAX))
            .map(|(_, member)| member)
    }

    /// Receipts for the message, in insertion order.
    pub fn receipts(&self, message_id: &MessageId) -> Vec<Receipt> {
        self.members(message_id)
            .filter_map(|member| {
                self.get(message_id, member).map(|cell| Receipt::new(member.clone(), cell))
            })
            .collect()
    }

    /// Cells for the message, in insertion order.
    pub fn cells(&self, message_id: &MessageId) -> Vec<StatusCell> {
        self.members(message_id).filter_map(|member| self.get(message_id, member)).collect()
    }

    /// Number of rows across all messages.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the index holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Inbound status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    /// Message the report is about
    pub message_id: MessageId,
    /// Member reporting, `None` for relay/transport reports
    #[serde(default)]
    pub acting_user_id: Option<UserId>,
    /// Reported status
    pub status: DeliveryStatus,
    /// When it happened
    pub at: Timestamp,
}

/// Outbound notification after an accepted transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotification {
    /// Message the transition belongs to
    pub message_id: MessageId,
    /// Member whose row moved, `None` for message-level transitions
    pub acting_user_id: Option<UserId>,
    /// New status
    pub status: DeliveryStatus,
    /// When it happened
    pub at: Timestamp,
}

/// Notifications produced by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryAction {
    /// Tell `to` (the author) about an accepted transition
    Notify {
        /// Recipient of the notification
        to: UserId,
        /// The transition
        notification: StatusNotification,
    },
    /// The sender-visible aggregate of a group message moved
    AggregateChanged {
        /// Recipient of the notification
        to: UserId,
        /// Group message
        message_id: MessageId,
        /// New aggregate
        status: DeliveryStatus,
    },
}

#[derive(Debug, Clone)]
struct Tracked {
    sender: UserId,
    target: Target,
    cell: StatusCell,
}

/// Tracks delivery status for every message the process knows.
///
/// # Invariants
///
/// - Every status only moves forward; stale reports change nothing
/// - Group messages have exactly one receipt row per notified member, never
///   one for the author
#[derive(Debug, Default)]
pub struct DeliveryStateMachine {
    messages: HashMap<MessageId, Tracked>,
    receipts: ReceiptIndex,
}

impl DeliveryStateMachine {
    /// Empty state machine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `message`.
    ///
    /// The message-level cell starts from the record's status. Group messages
    /// get a row in [`INITIAL_RECEIPT_STATUS`] for each of `recipients` other
    /// than the author; `recipients` is ignored for direct messages.
    ///
    /// # Errors
    ///
    /// - `DuplicateMessage` if the id is already tracked
    /// - `InvalidAddressing`/`InvalidRecord` if the record is malformed
    pub fn track(
        &mut self,
        message: &Message,
        recipients: impl IntoIterator<Item = UserId>,
    ) -> Result<(), CoreError> {
        let target = message.validate()?;
        if self.messages.contains_key(&message.id) {
            return Err(CoreError::DuplicateMessage(message.id.clone()));
        }

        if matches!(target, Target::Group(_)) {
            for member in recipients {
                if member != message.sender_id {
                    self.receipts.insert(
                        &message.id,
                        &member,
                        StatusCell::new(INITIAL_RECEIPT_STATUS),
                    );
                }
            }
        }

        self.messages.insert(
            message.id.clone(),
            Tracked { sender: message.sender_id.clone(), target, cell: message.status_cell() },
        );
        Ok(())
    }

    /// Rebuild tracking for a persisted message and its receipts.
    ///
    /// # Errors
    ///
    /// - `DuplicateMessage` if the id is already tracked
    pub fn restore(&mut self, message: &Message, receipts: &[Receipt]) -> Result<(), CoreError> {
        let target = message.validate()?;
        if self.messages.contains_key(&message.id) {
            return Err(CoreError::DuplicateMessage(message.id.clone()));
        }

        for receipt in receipts {
            self.receipts.insert(&message.id, &receipt.user_id, receipt.cell());
        }
        self.messages.insert(
            message.id.clone(),
            Tracked { sender: message.sender_id.clone(), target, cell: message.status_cell() },
        );
        Ok(())
    }

    /// Whether `message_id` is tracked.
    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.messages.contains_key(message_id)
    }

    /// Apply a status report.
    ///
    /// Direct messages: `Delivered`/`Seen` must come from the recipient and
    /// `Sent`/`Failed` from the author, or without an actor. Group messages:
    /// reports without an actor move the message-level status (`Sent`,
    /// `Failed`); reports with one move that member's row.
    ///
    /// # Errors
    ///
    /// - `UnknownMessage` if the message is not tracked
    /// - `NotARecipient` if the actor may not report this status
    pub fn advance(&mut self, event: &StatusEvent) -> Result<Vec<DeliveryAction>, CoreError> {
        let tracked = self
            .messages
            .get_mut(&event.message_id)
            .ok_or_else(|| CoreError::UnknownMessage(event.message_id.clone()))?;

        let not_a_recipient = || CoreError::NotARecipient {
            message_id: event.message_id.clone(),
            user_id: event.acting_user_id.clone(),
        };

        match &tracked.target {
            Target::Direct(receiver) => {
                let allowed = match (event.status, &event.acting_user_id) {
                    (_, None) => true,
                    (DeliveryStatus::Delivered | DeliveryStatus::Seen, Some(actor)) => {
                        actor == receiver
                    },
                    (_, Some(actor)) => actor == &tracked.sender,
                };
                if !allowed {
                    return Err(not_a_recipient());
                }

                let outcome = tracked.cell.advance(event.status, event.at);
                Ok(notify_if_applied(outcome, &tracked.sender, event))
            },
            Target::Group(_) => {
                let before = aggregate_status(tracked.cell.status, &self.receipts.cells(&event.message_id));

                let outcome = match &event.acting_user_id {
                    None => {
                        if !matches!(event.status, DeliveryStatus::Sent | DeliveryStatus::Failed) {
                            return Err(not_a_recipient());
                        }
                        tracked.cell.advance(event.status, event.at)
                    },
                    Some(member) => self
                        .receipts
                        .advance(&event.message_id, member, event.status, event.at)
                        .ok_or_else(not_a_recipient)?,
                };

                let mut actions = notify_if_applied(outcome, &tracked.sender, event);
                if outcome.is_applied() {
                    let after =
                        aggregate_status(tracked.cell.status, &self.receipts.cells(&event.message_id));
                    if after != before {
                        actions.push(DeliveryAction::AggregateChanged {
                            to: tracked.sender.clone(),
                            message_id: event.message_id.clone(),
                            status: after,
                        });
                    }
                }
                Ok(actions)
            },
        }
    }

    /// Message-level cell: the direct status, or the relay's status for a
    /// group message.
    pub fn message_cell(&self, message_id: &MessageId) -> Option<StatusCell> {
        self.messages.get(message_id).map(|tracked| tracked.cell)
    }

    /// Status the author sees: the direct status, or the folded group
    /// aggregate.
    pub fn status(&self, message_id: &MessageId) -> Option<DeliveryStatus> {
        let tracked = self.messages.get(message_id)?;
        Some(match tracked.target {
            Target::Direct(_) => tracked.cell.status,
            Target::Group(_) => aggregate_status(tracked.cell.status, &self.receipts.cells(message_id)),
        })
    }

    /// `member`'s receipt for a group message.
    pub fn receipt(&self, message_id: &MessageId, member: &UserId) -> Option<Receipt> {
        self.receipts.get(message_id, member).map(|cell| Receipt::new(member.clone(), cell))
    }

    /// All receipts for a group message, in insertion order.
    pub fn receipts(&self, message_id: &MessageId) -> Vec<Receipt> {
        self.receipts.receipts(message_id)
    }

    /// The receipt index.
    pub fn receipt_index(&self) -> &ReceiptIndex {
        &self.receipts
    }
}

fn notify_if_applied(outcome: Advance, sender: &UserId, event: &StatusEvent) -> Vec<DeliveryAction> {
    match outcome {
        Advance::Applied { previous } => {
            trace!(
                message_id = %event.message_id,
                from = ?previous,
                to = ?event.status,
                "status advanced"
            );
            vec![DeliveryAction::Notify {
                to: sender.clone(),
                notification: StatusNotification {
                    message_id: event.message_id.clone(),
                    acting_user_id: event.acting_user_id.clone(),
                    status: event.status,
                    at: event.at,
                },
            }]
        },
        Advance::Stale => {
            trace!(message_id = %event.message_id, status = ?event.status, "stale status ignored");
            Vec::new()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::GroupId;
    use DeliveryStatus::{Delivered, Failed, Seen, Sending, Sent};

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn mid(id: &str) -> MessageId {
        MessageId::new(id).unwrap()
    }

    fn ts(millis: u64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    fn event(id: &str, actor: Option<&str>, status: DeliveryStatus, at: u64) -> StatusEvent {
        StatusEvent {
            message_id: mid(id),
            acting_user_id: actor.map(user),
            status,
            at: ts(at),
        }
    }

    fn tracked_direct() -> DeliveryStateMachine {
        let mut machine = DeliveryStateMachine::new();
        let message = Message::direct(mid("d1"), user("alice"), user("bob"), "hi", ts(1));
        machine.track(&message, []).unwrap();
        machine
    }

    fn tracked_group() -> DeliveryStateMachine {
        let mut machine = DeliveryStateMachine::new();
        let message =
            Message::group(mid("g1"), user("alice"), GroupId::new("team").unwrap(), "hi", ts(1));
        machine.track(&message, ["alice", "bob", "carol", "dave"].map(user)).unwrap();
        machine
    }

    #[test]
    fn direct_message_advances_and_notifies_sender() {
        let mut machine = tracked_direct();

        let actions = machine.advance(&event("d1", None, Sent, 2)).unwrap();
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], DeliveryAction::Notify { to, .. } if to == &user("alice")));

        machine.advance(&event("d1", Some("bob"), Delivered, 3)).unwrap();
        assert_eq!(machine.status(&mid("d1")), Some(Delivered));
    }

    #[test]
    fn stale_report_is_silent() {
        let mut machine = tracked_direct();
        machine.advance(&event("d1", Some("bob"), Seen, 5)).unwrap();

        let actions = machine.advance(&event("d1", Some("bob"), Delivered, 6)).unwrap();
        assert!(actions.is_empty());
        assert_eq!(machine.status(&mid("d1")), Some(Seen));
    }

    #[test]
    fn failed_sticks() {
        let mut machine = tracked_direct();
        machine.advance(&event("d1", None, Failed, 2)).unwrap();

        assert!(machine.advance(&event("d1", Some("bob"), Seen, 3)).unwrap().is_empty());
        assert_eq!(machine.status(&mid("d1")), Some(Failed));
    }

    #[test]
    fn direct_receipts_only_from_recipient() {
        let mut machine = tracked_direct();

        let err = machine.advance(&event("d1", Some("mallory"), Seen, 2)).unwrap_err();
        assert!(matches!(err, CoreError::NotARecipient { .. }));

        let err = machine.advance(&event("d1", Some("alice"), Delivered, 2)).unwrap_err();
        assert!(matches!(err, CoreError::NotARecipient { .. }));
    }

    #[test]
    fn unknown_message_is_reported() {
        let mut machine = DeliveryStateMachine::new();
        let err = machine.advance(&event("nope", None, Sent, 1)).unwrap_err();

        assert_eq!(err, CoreError::UnknownMessage(mid("nope")));
    }

    #[test]
    fn duplicate_track_rejected() {
        let mut machine = tracked_direct();
        let message = Message::direct(mid("d1"), user("alice"), user("bob"), "hi", ts(1));

        assert!(matches!(machine.track(&message, []), Err(CoreError::DuplicateMessage(_))));
    }

    #[test]
    fn group_rows_exclude_author_and_keep_order() {
        let machine = tracked_group();
        let members: Vec<_> = machine.receipts(&mid("g1")).into_iter().map(|r| r.user_id).collect();

        assert_eq!(members, ["bob", "carol", "dave"].map(user));
    }

    #[test]
    fn group_aggregate_needs_every_member() {
        let mut machine = tracked_group();
        machine.advance(&event("g1", None, Sent, 2)).unwrap();
        machine.advance(&event("g1", Some("bob"), Delivered, 3)).unwrap();
        machine.advance(&event("g1", Some("carol"), Delivered, 4)).unwrap();
        assert_eq!(machine.status(&mid("g1")), Some(Sent));

        let actions = machine.advance(&event("g1", Some("dave"), Seen, 5)).unwrap();
        assert_eq!(machine.status(&mid("g1")), Some(Delivered));
        assert!(actions.iter().any(|action| matches!(
            action,
            DeliveryAction::AggregateChanged { status: Delivered, .. }
        )));
    }

    #[test]
    fn group_member_without_row_is_rejected() {
        let mut machine = tracked_group();

        let err = machine.advance(&event("g1", Some("eve"), Delivered, 2)).unwrap_err();
        assert!(matches!(err, CoreError::NotARecipient { .. }));
        let err = machine.advance(&event("g1", None, Delivered, 2)).unwrap_err();
        assert!(matches!(err, CoreError::NotARecipient { user_id: None, .. }));
    }

    #[test]
    fn group_ack_moves_message_level_status() {
        let mut machine = tracked_group();
        assert_eq!(machine.status(&mid("g1")), Some(Sending));

        let actions = machine.advance(&event("g1", None, Sent, 2)).unwrap();
        assert_eq!(machine.message_cell(&mid("g1")).unwrap().status, Sent);
        assert!(actions.iter().any(|action| matches!(
            action,
            DeliveryAction::AggregateChanged { status: Sent, .. }
        )));
    }

    #[test]
    fn restore_rebuilds_rows() {
        let mut original = tracked_group();
        original.advance(&event("g1", None, Sent, 2)).unwrap();
        original.advance(&event("g1", Some("bob"), Seen, 3)).unwrap();

        let mut message =
            Message::group(mid("g1"), user("alice"), GroupId::new("team").unwrap(), "hi", ts(1));
        message.set_status_cell(original.message_cell(&mid("g1")).unwrap());

        let mut restored = DeliveryStateMachine::new();
        restored.restore(&message, &original.receipts(&mid("g1"))).unwrap();

        assert_eq!(restored.receipts(&mid("g1")), original.receipts(&mid("g1")));
        assert_eq!(restored.status(&mid("g1")), original.status(&mid("g1")));
    }

    #[test]
    fn receipt_index_rejects_duplicate_rows() {
        let mut index = ReceiptIndex::new();
        assert!(index.insert(&mid("m"), &user("bob"), StatusCell::new(Sent)));
        assert!(!index.insert(&mid("m"), &user("bob"), StatusCell::new(Seen)));

        assert_eq!(index.get(&mid("m"), &user("bob")).unwrap().status, Sent);
        assert_eq!(index.len(), 1);
    }
}
