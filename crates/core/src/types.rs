use serde::{Deserialize, Serialize};

/// Canonical internal representation of one inbound webhook call, independent
/// of the provider's wire format.
///
/// `email` is already trimmed and lower-cased; it may be empty, in which case
/// the event is logged but never mutates entitlement state. `invoice_status`
/// carries the provider value uninterpreted; the mapping to an access
/// transition is owned by [`crate::classifier`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Deduplication key: provider event id, else invoice id, else synthesized.
    pub event_id: String,
    /// Raw provider event name, lower-cased. Empty for legacy form posts.
    pub event: String,
    pub email: String,
    pub invoice_id: Option<String>,
    pub invoice_status: Option<String>,
    pub product_id: Option<String>,
    pub product_title: Option<String>,
}

impl NormalizedEvent {
    /// Returns `true` when a buyer email could be extracted.
    pub fn has_email(&self) -> bool {
        !self.email.is_empty()
    }

    /// Classifies this event into an [`EventKind`].
    pub fn kind(&self) -> EventKind {
        crate::classifier::classify(&self.event, self.invoice_status.as_deref())
    }
}

/// Purchase-lifecycle event kinds the reconciler understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    InvoiceOpened,
    InvoicePaid,
    InvoiceCanceled,
    Unknown,
}

impl EventKind {
    /// All variants, used by tests that assert the transition table is total.
    pub const ALL: [EventKind; 4] = [
        Self::InvoiceOpened,
        Self::InvoicePaid,
        Self::InvoiceCanceled,
        Self::Unknown,
    ];

    /// Canonical label used for logging and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvoiceOpened => "invoice_opened",
            Self::InvoicePaid => "invoice_paid",
            Self::InvoiceCanceled => "invoice_canceled",
            Self::Unknown => "unknown",
        }
    }

    /// Total mapping from event kind to the resulting entitlement flags.
    ///
    /// Unrecognized events fall back to pending: access is never granted on
    /// an event the classifier does not understand.
    pub fn transition(self) -> AccessTransition {
        match self {
            Self::InvoiceOpened | Self::Unknown => AccessTransition {
                active: false,
                pending: true,
            },
            Self::InvoicePaid => AccessTransition {
                active: true,
                pending: false,
            },
            Self::InvoiceCanceled => AccessTransition {
                active: false,
                pending: false,
            },
        }
    }

    /// Status recorded on the entitlement when the payload carried none.
    pub fn default_status(self) -> Option<&'static str> {
        match self {
            Self::InvoiceOpened => Some("opened"),
            Self::InvoicePaid => Some("paid"),
            Self::InvoiceCanceled => Some("canceled"),
            Self::Unknown => None,
        }
    }
}

/// Entitlement flags resulting from a classified event.
///
/// Invariant: `active` and `pending` are never both `true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessTransition {
    pub active: bool,
    pub pending: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_is_total_and_consistent() {
        // Every variant maps to exactly one row, and active/pending are
        // mutually exclusive for all of them.
        for kind in EventKind::ALL {
            let transition = kind.transition();
            assert!(
                !(transition.active && transition.pending),
                "{} sets both active and pending",
                kind.as_str()
            );
            let expected = match kind {
                EventKind::InvoiceOpened => (false, true),
                EventKind::InvoicePaid => (true, false),
                EventKind::InvoiceCanceled => (false, false),
                EventKind::Unknown => (false, true),
            };
            assert_eq!((transition.active, transition.pending), expected);
        }
    }

    #[test]
    fn unknown_never_grants_access() {
        assert!(!EventKind::Unknown.transition().active);
    }

    #[test]
    fn has_email_rejects_empty() {
        let event = NormalizedEvent {
            event_id: "evt-1".to_string(),
            event: "invoice_paid".to_string(),
            email: String::new(),
            invoice_id: None,
            invoice_status: None,
            product_id: None,
            product_title: None,
        };
        assert!(!event.has_email());
    }
}
