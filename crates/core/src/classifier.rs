use crate::types::EventKind;

/// Maps an event name and the raw invoice status onto an [`EventKind`].
///
/// The provider populates either the event name or the status depending on
/// the integration mode, so a match in either source is sufficient.
/// Cancellation markers are checked first; a paid marker wins over an opened
/// one when both appear.
pub fn classify(event: &str, raw_status: Option<&str>) -> EventKind {
    let event = event.trim().to_lowercase();
    let status = raw_status.map(|s| s.trim().to_lowercase()).unwrap_or_default();

    if is_canceled_event(&event) || is_canceled_status(&status) {
        return EventKind::InvoiceCanceled;
    }
    if is_paid_event(&event) || is_paid_status(&status) {
        return EventKind::InvoicePaid;
    }
    if is_opened_event(&event) || is_opened_status(&status) {
        return EventKind::InvoiceOpened;
    }
    EventKind::Unknown
}

fn is_canceled_event(event: &str) -> bool {
    event.contains("cancel") || event.contains("refund") || event.contains("chargeback")
}

fn is_canceled_status(status: &str) -> bool {
    // Legacy form posts carry numeric status codes: 4 refund, 6 canceled,
    // 7 chargeback. Word forms include the provider's localized spellings.
    matches!(status, "4" | "6" | "7")
        || status.contains("cancel")
        || status.contains("cancelada")
        || status.contains("refund")
        || status.contains("reembolso")
        || status.contains("chargeback")
}

fn is_paid_event(event: &str) -> bool {
    event.contains("paid")
}

fn is_paid_status(status: &str) -> bool {
    matches!(status, "3" | "paid" | "paga" | "pago")
}

fn is_opened_event(event: &str) -> bool {
    event.contains("open")
}

fn is_opened_status(status: &str) -> bool {
    matches!(status, "1" | "opened" | "open" | "aberta")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_event_names() {
        assert_eq!(classify("myeduzz.invoice_paid", None), EventKind::InvoicePaid);
        assert_eq!(
            classify("myeduzz.invoice_canceled", None),
            EventKind::InvoiceCanceled
        );
        assert_eq!(
            classify("myeduzz.invoice_opened", None),
            EventKind::InvoiceOpened
        );
        assert_eq!(classify("customer.updated", None), EventKind::Unknown);
    }

    #[test]
    fn status_alone_is_sufficient() {
        assert_eq!(classify("", Some("paid")), EventKind::InvoicePaid);
        assert_eq!(classify("", Some("Paga")), EventKind::InvoicePaid);
        assert_eq!(classify("", Some("3")), EventKind::InvoicePaid);
        assert_eq!(classify("", Some("1")), EventKind::InvoiceOpened);
        assert_eq!(classify("", Some("6")), EventKind::InvoiceCanceled);
        assert_eq!(classify("", Some("chargeback")), EventKind::InvoiceCanceled);
    }

    #[test]
    fn cancellation_wins_over_payment_markers() {
        // A refund event may still carry the paid invoice status it reverses.
        assert_eq!(
            classify("invoice_refunded", Some("paid")),
            EventKind::InvoiceCanceled
        );
    }

    #[test]
    fn paid_wins_over_opened() {
        assert_eq!(
            classify("invoice_paid", Some("opened")),
            EventKind::InvoicePaid
        );
    }

    #[test]
    fn case_and_whitespace_are_ignored() {
        assert_eq!(classify("  INVOICE_PAID ", None), EventKind::InvoicePaid);
        assert_eq!(classify("", Some(" CANCELADA ")), EventKind::InvoiceCanceled);
    }

    #[test]
    fn unrecognized_inputs_are_unknown() {
        assert_eq!(classify("", None), EventKind::Unknown);
        assert_eq!(classify("ping", Some("99")), EventKind::Unknown);
    }
}
