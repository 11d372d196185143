//! Delivery status ordering and the per-recipient transition cell.
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐  ack   ┌──────┐ received ┌───────────┐ viewed ┌──────┐
//! │ Sending │───────>│ Sent │─────────>│ Delivered │───────>│ Seen │
//! └─────────┘        └──────┘          └───────────┘        └──────┘
//!      │                 │                   │
//!      │ give up         │                   │
//!      ↓                 ↓                   ↓
//! ┌──────────────────────────────────────────────┐
//! │                    Failed                    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Forward jumps are allowed (`Sent → Seen`). Anything that is not strictly
//! later is absorbed as stale, which makes every transition idempotent and
//! safe against reordered or duplicated events.

use serde::{Deserialize, Serialize};

use crate::ids::{Timestamp, UserId};

/// Delivery status of a message (direct) or of one member's receipt (group).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Created client-side, not yet acknowledged by the relay
    #[default]
    Sending,
    /// Relay acknowledged persistence
    Sent,
    /// Recipient's client received the message
    Delivered,
    /// Recipient viewed the message
    Seen,
    /// Transport gave up
    Failed,
}

impl DeliveryStatus {
    /// Position in the forward ordering. `None` for `Failed`, which is outside
    /// the ordering.
    pub fn progress(self) -> Option<u8> {
        match self {
            Self::Sending => Some(0),
            Self::Sent => Some(1),
            Self::Delivered => Some(2),
            Self::Seen => Some(3),
            Self::Failed => None,
        }
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Seen | Self::Failed)
    }

    /// Whether moving from `self` to `next` is an accepted transition.
    ///
    /// `Failed` overrides any non-terminal state; otherwise `next` must be
    /// strictly later in the ordering.
    pub fn accepts(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.progress(), next.progress()) {
            (_, None) => true,
            (Some(current), Some(next)) => next > current,
            (None, Some(_)) => false,
        }
    }
}

/// Result of offering a status to a [`StatusCell`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Transition accepted
    Applied {
        /// Status before the transition
        previous: DeliveryStatus,
    },
    /// Not later than the current status; nothing changed
    Stale,
}

impl Advance {
    /// Whether the transition was accepted.
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Status plus its timestamps, for one message or one member receipt.
///
/// # Invariants
///
/// - `status` only moves forward (see [`DeliveryStatus::accepts`])
/// - `seen_at` set implies `delivered_at` set and `delivered_at <= seen_at`
/// - Timestamps never change once set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCell {
    /// Current status
    pub status: DeliveryStatus,
    /// When the recipient received the message
    pub delivered_at: Option<Timestamp>,
    /// When the recipient viewed the message
    pub seen_at: Option<Timestamp>,
}

impl StatusCell {
    /// Cell in `status` with no timestamps.
    pub fn new(status: DeliveryStatus) -> Self {
        Self { status, delivered_at: None, seen_at: None }
    }

    /// Compare-and-set against the stored ordinal.
    ///
    /// Entering `Seen` without a prior `Delivered` stamps both. `seen_at` is
    /// clamped so it never precedes `delivered_at`.
    pub fn advance(&mut self, next: DeliveryStatus, at: Timestamp) -> Advance {
        let previous = self.status;
        if !previous.accepts(next) {
            return Advance::Stale;
        }

        match next {
            DeliveryStatus::Delivered => {
                self.delivered_at.get_or_insert(at);
            },
            DeliveryStatus::Seen => {
                let delivered_at = *self.delivered_at.get_or_insert(at);
                self.seen_at = Some(at.max(delivered_at));
            },
            DeliveryStatus::Sending | DeliveryStatus::Sent | DeliveryStatus::Failed => {},
        }

        self.status = next;

        debug_assert!(self.seen_at.is_none() || self.delivered_at <= self.seen_at);
        Advance::Applied { previous }
    }
}

/// One member's receipt for a group message, in wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    /// Member this receipt belongs to
    pub user_id: UserId,
    /// Member's delivery status
    pub status: DeliveryStatus,
    /// When the member received the message
    pub delivered_at: Option<Timestamp>,
    /// When the member viewed the message
    pub seen_at: Option<Timestamp>,
}

impl Receipt {
    /// Receipt from a member id and their cell.
    pub fn new(user_id: UserId, cell: StatusCell) -> Self {
        Self {
            user_id,
            status: cell.status,
            delivered_at: cell.delivered_at,
            seen_at: cell.seen_at,
        }
    }

    /// The transition cell for this receipt.
    pub fn cell(&self) -> StatusCell {
        StatusCell { status: self.status, delivered_at: self.delivered_at, seen_at: self.seen_at }
    }
}

/// Sender-visible status of a group message, folded over member receipts.
///
/// - A message still `Sending` or already `Failed` reports that.
/// - With no receipts the message-level status stands.
/// - `Failed` receipts are ignored unless every receipt failed.
/// - Otherwise the least-advanced live receipt wins: `Seen` only once every
///   member has seen it, `Delivered` once every member has at least received
///   it.
pub fn aggregate_status<'a>(
    message_status: DeliveryStatus,
    receipts: impl IntoIterator<Item = &'a StatusCell>,
) -> DeliveryStatus {
    if matches!(message_status, DeliveryStatus::Sending | DeliveryStatus::Failed) {
        return message_status;
    }

    let mut any = false;
    let mut least: Option<(u8, DeliveryStatus)> = None;
    for cell in receipts {
        any = true;
        let Some(progress) = cell.status.progress() else {
            continue;
        };
        if least.is_none_or(|(p, _)| progress < p) {
            least = Some((progress, cell.status));
        }
    }

    match (any, least) {
        (false, _) => message_status,
        (true, None) => DeliveryStatus::Failed,
        (true, Some((_, status))) => status,
    }
}
