//! Allocation policy for signed ledger adjustments.
//!
//! Every adjustment is classified by the sign of the client's cached balance
//! and the sign of the amount:
//!
//! | balance | amount | handling                                   |
//! |---------|--------|--------------------------------------------|
//! | >= 0    | > 0    | open a new debt entry                      |
//! | >= 0    | < 0    | distribute the payment across open entries |
//! | < 0     | > 0    | consume the open credit entry              |
//! | < 0     | < 0    | distribute (extends the credit)            |
//!
//! Payment distribution walks valid entries oldest-first: an entry whose
//! value fits into the remaining payment is settled, a larger entry is paid
//! down in place and the walk stops. Payment left over after the last entry
//! becomes a new credit entry. Credit consumption draws a purchase down from
//! the oldest open credit entry, opening a remainder debt entry when the
//! purchase is larger than the credit.
//!
//! Whenever the resulting balance lands exactly on zero, every entry still
//! valid is closed in place with its residual value preserved, and an entry
//! opened by that same adjustment is recorded born-closed, so a settled
//! client always reads as "no open entries".
//!
//! Planning is pure: this module turns `(balance, open entries, amount)`
//! into an [`AllocationPlan`] without touching storage. The store executes
//! the plan in a single write transaction.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::HashSet;

use crate::models::LedgerEntry;

/// Which branch of the allocation policy handled an adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationCase {
    NewDebt,
    PaymentDistribution,
    CreditConsumption,
    CreditExtension,
}

impl AllocationCase {
    pub fn as_str(&self) -> &str {
        match self {
            AllocationCase::NewDebt => "new_debt",
            AllocationCase::PaymentDistribution => "payment_distribution",
            AllocationCase::CreditConsumption => "credit_consumption",
            AllocationCase::CreditExtension => "credit_extension",
        }
    }
}

/// How a planned mutation changes an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// Debt entry reduced in place, stays valid.
    PayDown,
    /// Entry fully covered by a payment. Value drops to zero, entry closes.
    Settle,
    /// Credit entry drawn toward zero by a purchase, stays valid.
    ReduceCredit,
    /// Credit entry emptied by a purchase. Value drops to zero, entry closes.
    ConsumeCredit,
    /// Closed by zero-balance normalization with its residual value kept.
    CloseOnZero,
}

impl MutationKind {
    /// True for kinds that flip `is_valid` off and stamp `repaid_at`.
    pub fn closes_entry(&self) -> bool {
        matches!(
            self,
            MutationKind::Settle | MutationKind::ConsumeCredit | MutationKind::CloseOnZero
        )
    }
}

/// One planned in-place mutation of an existing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMutation {
    pub entry_id: i64,
    pub kind: MutationKind,
    pub value_before: i64,
    pub value_after: i64,
    /// Line appended to the entry's history log.
    pub note: String,
}

/// A new entry the plan opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub value: i64,
    /// Initial history log of the new entry. Normally the opening line
    /// alone; a normalizing plan appends its closing line too.
    pub note: String,
}

/// Complete effect of one adjustment, ready for transactional execution.
#[derive(Debug, Clone)]
pub struct AllocationPlan {
    pub case: AllocationCase,
    pub client_id: i64,
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub mutations: Vec<EntryMutation>,
    pub new_entry: Option<NewEntry>,
    /// Balance landed on zero: surviving entries were closed and the new
    /// entry, if any, is born closed.
    pub normalized: bool,
    /// Credit consumption found no open credit entry and fell back to
    /// opening a plain debt entry.
    pub credit_fallback: bool,
    /// Timestamp shared by every mutation of this plan.
    pub at: DateTime<Utc>,
}

fn note_line(at: DateTime<Utc>, tag: &str, msg: &str) -> String {
    format!(
        "{} [{}] {}",
        at.to_rfc3339_opts(SecondsFormat::Secs, true),
        tag,
        msg
    )
}

/// Plan the allocation of a signed `amount` against a client ledger.
///
/// `open_entries` must hold the client's valid entries oldest-first; the
/// caller is responsible for reading them under the client's allocation lock
/// so the plan executes against the same state it was built from. `amount`
/// must be nonzero and `balance + amount` must be representable; the service
/// validates both before planning.
pub fn plan_allocation(
    client_id: i64,
    balance: i64,
    open_entries: &[LedgerEntry],
    amount: i64,
    at: DateTime<Utc>,
    tag: &str,
) -> AllocationPlan {
    let case = if balance >= 0 {
        if amount > 0 {
            AllocationCase::NewDebt
        } else {
            AllocationCase::PaymentDistribution
        }
    } else if amount > 0 {
        AllocationCase::CreditConsumption
    } else {
        AllocationCase::CreditExtension
    };

    let mut mutations: Vec<EntryMutation> = Vec::new();
    let mut new_entry: Option<NewEntry> = None;
    let mut credit_fallback = false;

    match case {
        AllocationCase::NewDebt => {
            new_entry = Some(NewEntry {
                value: amount,
                note: note_line(at, tag, &format!("opened with {}", amount)),
            });
        }
        AllocationCase::PaymentDistribution | AllocationCase::CreditExtension => {
            let payment = -amount;
            let leftover = distribute_payment(open_entries, payment, at, tag, &mut mutations);
            if leftover > 0 {
                new_entry = Some(NewEntry {
                    value: -leftover,
                    note: note_line(
                        at,
                        tag,
                        &format!(
                            "opened as credit {} from excess payment {}",
                            -leftover, payment
                        ),
                    ),
                });
            }
        }
        AllocationCase::CreditConsumption => {
            match open_entries.iter().find(|e| e.value < 0) {
                None => {
                    // Balance says credit exists but no entry backs it.
                    // Degrade to an ordinary debt entry instead of failing.
                    credit_fallback = true;
                    new_entry = Some(NewEntry {
                        value: amount,
                        note: note_line(at, tag, &format!("opened with {}", amount)),
                    });
                }
                Some(credit) => {
                    let available = -credit.value;
                    if amount < available {
                        let after = credit.value + amount;
                        mutations.push(EntryMutation {
                            entry_id: credit.id,
                            kind: MutationKind::ReduceCredit,
                            value_before: credit.value,
                            value_after: after,
                            note: note_line(
                                at,
                                tag,
                                &format!(
                                    "credit reduced {} -> {} (purchase {})",
                                    credit.value, after, amount
                                ),
                            ),
                        });
                    } else {
                        mutations.push(EntryMutation {
                            entry_id: credit.id,
                            kind: MutationKind::ConsumeCredit,
                            value_before: credit.value,
                            value_after: 0,
                            note: note_line(
                                at,
                                tag,
                                &format!("credit consumed by purchase {}", amount),
                            ),
                        });
                        let rest = amount - available;
                        if rest > 0 {
                            new_entry = Some(NewEntry {
                                value: rest,
                                note: note_line(at, tag, &format!("opened with {}", rest)),
                            });
                        }
                    }
                }
            }
        }
    }

    let balance_after = balance + amount;
    let normalized = balance_after == 0;
    if normalized {
        close_survivors(open_entries, at, tag, &mut mutations);
        if let Some(new) = new_entry.as_mut() {
            new.note.push('\n');
            new.note
                .push_str(&note_line(at, tag, "closed by zero-balance normalization"));
        }
    }

    AllocationPlan {
        case,
        client_id,
        amount,
        balance_before: balance,
        balance_after,
        mutations,
        new_entry,
        normalized,
        credit_fallback,
        at,
    }
}

/// Walk entries oldest-first, settling what fits and paying down the first
/// entry that does not. Returns the payment left after the walk.
///
/// A stray credit entry encountered mid-walk satisfies `value <= remaining`
/// and is folded in, growing the remaining pool by its magnitude. That keeps
/// the balance/entry-sum identity intact for mixed-sign ledgers and is what
/// consolidates the old credit entry when a payment extends existing credit.
fn distribute_payment(
    open_entries: &[LedgerEntry],
    payment: i64,
    at: DateTime<Utc>,
    tag: &str,
    mutations: &mut Vec<EntryMutation>,
) -> i64 {
    let mut remaining = payment;
    for entry in open_entries {
        if remaining == 0 {
            break;
        }
        if entry.value <= remaining {
            remaining -= entry.value;
            mutations.push(EntryMutation {
                entry_id: entry.id,
                kind: MutationKind::Settle,
                value_before: entry.value,
                value_after: 0,
                note: note_line(at, tag, &format!("settled by payment {}", payment)),
            });
        } else {
            let after = entry.value - remaining;
            mutations.push(EntryMutation {
                entry_id: entry.id,
                kind: MutationKind::PayDown,
                value_before: entry.value,
                value_after: after,
                note: note_line(
                    at,
                    tag,
                    &format!("paid down {} -> {} (payment {})", entry.value, after, payment),
                ),
            });
            remaining = 0;
            break;
        }
    }
    remaining
}

/// Close every entry the plan has not already closed, keeping residual
/// values. Runs only when the post-adjustment balance is exactly zero.
fn close_survivors(
    open_entries: &[LedgerEntry],
    at: DateTime<Utc>,
    tag: &str,
    mutations: &mut Vec<EntryMutation>,
) {
    let already_closed: HashSet<i64> = mutations
        .iter()
        .filter(|m| m.kind.closes_entry())
        .map(|m| m.entry_id)
        .collect();

    let mut closes: Vec<EntryMutation> = Vec::new();
    for entry in open_entries {
        if already_closed.contains(&entry.id) {
            continue;
        }
        // A prior mutation in this plan may have changed the value already.
        let residual = mutations
            .iter()
            .rev()
            .find(|m| m.entry_id == entry.id)
            .map(|m| m.value_after)
            .unwrap_or(entry.value);
        closes.push(EntryMutation {
            entry_id: entry.id,
            kind: MutationKind::CloseOnZero,
            value_before: residual,
            value_after: residual,
            note: note_line(at, tag, "closed by zero-balance normalization"),
        });
    }
    mutations.extend(closes);
}
