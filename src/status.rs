// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Document lifecycle state machine.
//!
//! Estimates:
//!
//! ```text
//! draft ──► pending_approval
//! draft | pending_approval ──► sent          (validity not lapsed)
//! sent ──► viewed
//! sent | viewed ──► accepted | rejected
//! accepted ──► converted
//! draft | pending_approval | sent | viewed | accepted ──► expired (validity lapsed)
//! ```
//!
//! Invoices:
//!
//! ```text
//! draft ──► sent ──► viewed
//! sent | viewed | partial ──► overdue (due date passed)
//! draft | sent | viewed | overdue ──► cancelled (nothing paid)
//! partial / paid / back to sent: derived from the amount paid, never requested
//! ```
//!
//! Every pair not listed is rejected with [`EngineError::InvalidTransition`].
//! Re-marking an expired estimate or an overdue invoice is a no-op so that
//! periodic sweeps can be retried freely.

use crate::sequence::DocumentType;
use crate::EngineError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Draft,
    PendingApproval,
    Sent,
    Viewed,
    Accepted,
    Rejected,
    Expired,
    Converted,
    Partial,
    Paid,
    Overdue,
    Cancelled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Draft => "draft",
            Status::PendingApproval => "pending_approval",
            Status::Sent => "sent",
            Status::Viewed => "viewed",
            Status::Accepted => "accepted",
            Status::Rejected => "rejected",
            Status::Expired => "expired",
            Status::Converted => "converted",
            Status::Partial => "partial",
            Status::Paid => "paid",
            Status::Overdue => "overdue",
            Status::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s.trim().to_lowercase().as_str() {
            "draft" => Status::Draft,
            "pending_approval" => Status::PendingApproval,
            "sent" => Status::Sent,
            "viewed" => Status::Viewed,
            "accepted" => Status::Accepted,
            "rejected" => Status::Rejected,
            "expired" => Status::Expired,
            "converted" => Status::Converted,
            "partial" => Status::Partial,
            "paid" => Status::Paid,
            "overdue" => Status::Overdue,
            "cancelled" => Status::Cancelled,
            other => {
                return Err(EngineError::validation(format!("unknown status '{other}'")));
            }
        };
        Ok(status)
    }
}

/// Facts a transition guard may depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionContext {
    pub now: DateTime<Utc>,
    /// `valid_until` for estimates, `due_date` for invoices.
    pub deadline: Option<DateTime<Utc>>,
    pub amount_paid: Decimal,
}

impl TransitionContext {
    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|deadline| self.now > deadline)
    }
}

fn invalid(current: Status, requested: Status) -> EngineError {
    EngineError::InvalidTransition {
        current: current.as_str(),
        requested: requested.as_str(),
    }
}

/// Validates a requested status change and returns the resulting status.
///
/// The result equals `current` only for idempotent re-marks (expired/overdue).
pub fn transition(
    document_type: DocumentType,
    current: Status,
    requested: Status,
    context: &TransitionContext,
) -> Result<Status, EngineError> {
    let allowed = match document_type {
        DocumentType::Estimate => estimate_allows(current, requested, context),
        DocumentType::Invoice => invoice_allows(current, requested, context),
    };
    if allowed {
        Ok(requested)
    } else {
        Err(invalid(current, requested))
    }
}

fn estimate_allows(current: Status, requested: Status, context: &TransitionContext) -> bool {
    use Status::*;
    match (current, requested) {
        (Draft, PendingApproval) => true,
        (Draft | PendingApproval, Sent) => !context.deadline_passed(),
        (Sent, Viewed) => true,
        (Sent | Viewed, Accepted | Rejected) => true,
        (Accepted, Converted) => true,
        (Draft | PendingApproval | Sent | Viewed | Accepted, Expired) => context.deadline_passed(),
        (Expired, Expired) => true,
        _ => false,
    }
}

fn invoice_allows(current: Status, requested: Status, context: &TransitionContext) -> bool {
    use Status::*;
    match (current, requested) {
        (Draft, Sent) => true,
        (Sent, Viewed) => true,
        (Sent | Viewed | Partial, Overdue) => context.deadline_passed(),
        (Overdue, Overdue) => true,
        (Draft | Sent | Viewed | Overdue, Cancelled) => context.amount_paid.is_zero(),
        _ => false,
    }
}

/// Derives an invoice's status from its amount paid and total.
///
/// - nothing paid: `partial`/`paid` fall back to `sent`, anything else stays
/// - paid in full (or more): `paid`
/// - paid in part: `partial`, except an overdue invoice stays `overdue`
///
/// # Errors
///
/// [`EngineError::InvalidTransition`] when money is applied to a cancelled invoice.
pub fn settle_invoice(
    current: Status,
    amount_paid: Decimal,
    total: Decimal,
) -> Result<Status, EngineError> {
    use Status::*;
    if amount_paid <= Decimal::ZERO {
        return Ok(match current {
            Partial | Paid => Sent,
            other => other,
        });
    }

    let derived = if amount_paid >= total { Paid } else { Partial };
    match current {
        Cancelled => Err(invalid(current, derived)),
        Overdue if derived == Partial => Ok(Overdue),
        _ => Ok(derived),
    }
}

/// Whether line items and pricing may change in this status.
pub fn is_editable(document_type: DocumentType, status: Status) -> bool {
    match document_type {
        DocumentType::Estimate => matches!(status, Status::Draft | Status::PendingApproval),
        DocumentType::Invoice => status != Status::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    const ALL: [Status; 12] = [
        Status::Draft,
        Status::PendingApproval,
        Status::Sent,
        Status::Viewed,
        Status::Accepted,
        Status::Rejected,
        Status::Expired,
        Status::Converted,
        Status::Partial,
        Status::Paid,
        Status::Overdue,
        Status::Cancelled,
    ];

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn open() -> TransitionContext {
        TransitionContext {
            now: now(),
            deadline: Some(now() + Duration::days(30)),
            amount_paid: Decimal::ZERO,
        }
    }

    fn lapsed() -> TransitionContext {
        TransitionContext {
            deadline: Some(now() - Duration::days(1)),
            ..open()
        }
    }

    #[test]
    fn estimate_happy_path() {
        let ctx = open();
        let mut status = Status::Draft;
        for next in [
            Status::PendingApproval,
            Status::Sent,
            Status::Viewed,
            Status::Accepted,
            Status::Converted,
        ] {
            status = transition(DocumentType::Estimate, status, next, &ctx).unwrap();
        }
        assert_eq!(status, Status::Converted);
    }

    #[test]
    fn estimate_cannot_convert_from_draft() {
        let result = transition(DocumentType::Estimate, Status::Draft, Status::Converted, &open());
        assert_eq!(
            result,
            Err(EngineError::InvalidTransition {
                current: "draft",
                requested: "converted"
            })
        );
    }

    #[test]
    fn estimate_converts_only_once() {
        let result = transition(
            DocumentType::Estimate,
            Status::Converted,
            Status::Converted,
            &open(),
        );
        assert!(matches!(result, Err(EngineError::InvalidTransition { .. })));
    }

    #[test]
    fn expired_estimate_cannot_be_sent() {
        let result = transition(DocumentType::Estimate, Status::Draft, Status::Sent, &lapsed());
        assert!(result.is_err());
    }

    #[test]
    fn estimate_without_validity_can_be_sent() {
        let ctx = TransitionContext {
            deadline: None,
            ..open()
        };
        assert_eq!(
            transition(DocumentType::Estimate, Status::Draft, Status::Sent, &ctx),
            Ok(Status::Sent)
        );
    }

    #[test]
    fn expiry_requires_lapsed_validity_and_is_idempotent() {
        assert!(
            transition(DocumentType::Estimate, Status::Sent, Status::Expired, &open()).is_err()
        );
        assert_eq!(
            transition(DocumentType::Estimate, Status::Sent, Status::Expired, &lapsed()),
            Ok(Status::Expired)
        );
        assert_eq!(
            transition(DocumentType::Estimate, Status::Expired, Status::Expired, &lapsed()),
            Ok(Status::Expired)
        );
        let rejected =
            transition(DocumentType::Estimate, Status::Rejected, Status::Expired, &lapsed());
        assert!(rejected.is_err());
    }

    #[test]
    fn accept_and_reject_require_sent_or_viewed() {
        for current in ALL {
            for requested in [Status::Accepted, Status::Rejected] {
                let result = transition(DocumentType::Estimate, current, requested, &open());
                let expected = matches!(current, Status::Sent | Status::Viewed);
                assert_eq!(result.is_ok(), expected, "{current} -> {requested}");
            }
        }
    }

    #[test]
    fn invoice_payment_states_cannot_be_requested() {
        for current in ALL {
            for requested in [Status::Partial, Status::Paid] {
                assert!(
                    transition(DocumentType::Invoice, current, requested, &open()).is_err(),
                    "{current} -> {requested}"
                );
            }
        }
    }

    #[test]
    fn invoice_never_uses_estimate_states() {
        for current in ALL {
            for requested in [
                Status::PendingApproval,
                Status::Accepted,
                Status::Rejected,
                Status::Expired,
                Status::Converted,
            ] {
                assert!(transition(DocumentType::Invoice, current, requested, &lapsed()).is_err());
            }
        }
    }

    #[test]
    fn estimate_never_uses_invoice_states() {
        for current in ALL {
            for requested in [
                Status::Partial,
                Status::Paid,
                Status::Overdue,
                Status::Cancelled,
            ] {
                assert!(transition(DocumentType::Estimate, current, requested, &lapsed()).is_err());
            }
        }
    }

    #[test]
    fn invoice_allow_list_is_exact() {
        let allowed = [
            (Status::Draft, Status::Sent),
            (Status::Sent, Status::Viewed),
            (Status::Sent, Status::Overdue),
            (Status::Viewed, Status::Overdue),
            (Status::Partial, Status::Overdue),
            (Status::Overdue, Status::Overdue),
            (Status::Draft, Status::Cancelled),
            (Status::Sent, Status::Cancelled),
            (Status::Viewed, Status::Cancelled),
            (Status::Overdue, Status::Cancelled),
        ];
        for current in ALL {
            for requested in ALL {
                let result = transition(DocumentType::Invoice, current, requested, &lapsed());
                assert_eq!(
                    result.is_ok(),
                    allowed.contains(&(current, requested)),
                    "{current} -> {requested}"
                );
            }
        }
    }

    #[test]
    fn overdue_requires_passed_due_date() {
        assert!(transition(DocumentType::Invoice, Status::Sent, Status::Overdue, &open()).is_err());
    }

    #[test]
    fn cancel_requires_nothing_paid() {
        let ctx = TransitionContext {
            amount_paid: dec!(10),
            ..lapsed()
        };
        assert!(
            transition(DocumentType::Invoice, Status::Overdue, Status::Cancelled, &ctx).is_err()
        );
    }

    #[test]
    fn settlement_follows_amount_paid() {
        assert_eq!(settle_invoice(Status::Sent, dec!(100), dec!(213.84)), Ok(Status::Partial));
        assert_eq!(settle_invoice(Status::Partial, dec!(213.84), dec!(213.84)), Ok(Status::Paid));
        assert_eq!(settle_invoice(Status::Paid, dec!(163.84), dec!(213.84)), Ok(Status::Partial));
        assert_eq!(settle_invoice(Status::Partial, dec!(0), dec!(213.84)), Ok(Status::Sent));
        assert_eq!(settle_invoice(Status::Paid, dec!(0), dec!(213.84)), Ok(Status::Sent));
        assert_eq!(settle_invoice(Status::Viewed, dec!(300), dec!(213.84)), Ok(Status::Paid));
    }

    #[test]
    fn settlement_without_payments_keeps_status() {
        for current in [
            Status::Draft,
            Status::Sent,
            Status::Viewed,
            Status::Overdue,
            Status::Cancelled,
        ] {
            assert_eq!(settle_invoice(current, Decimal::ZERO, dec!(50)), Ok(current));
        }
    }

    #[test]
    fn overdue_invoice_stays_overdue_until_paid() {
        assert_eq!(settle_invoice(Status::Overdue, dec!(10), dec!(50)), Ok(Status::Overdue));
        assert_eq!(settle_invoice(Status::Overdue, dec!(50), dec!(50)), Ok(Status::Paid));
    }

    #[test]
    fn cancelled_invoice_rejects_money() {
        assert_eq!(
            settle_invoice(Status::Cancelled, dec!(5), dec!(50)),
            Err(EngineError::InvalidTransition {
                current: "cancelled",
                requested: "partial"
            })
        );
    }

    #[test]
    fn editability() {
        assert!(is_editable(DocumentType::Estimate, Status::Draft));
        assert!(is_editable(DocumentType::Estimate, Status::PendingApproval));
        assert!(!is_editable(DocumentType::Estimate, Status::Sent));
        assert!(is_editable(DocumentType::Invoice, Status::Paid));
        assert!(!is_editable(DocumentType::Invoice, Status::Cancelled));
    }

    #[test]
    fn status_parses_snake_case() {
        assert_eq!("pending_approval".parse::<Status>().unwrap(), Status::PendingApproval);
        assert_eq!("PAID".parse::<Status>().unwrap(), Status::Paid);
        assert!("archived".parse::<Status>().is_err());
    }
}
