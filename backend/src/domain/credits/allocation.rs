//! Pure allocation planning for debits and refunds.
//!
//! Stores call these planners inside their transactions so the consumption
//! order is identical across the in-memory fixture and the Diesel adapter.

use chrono::{DateTime, Utc};

use crate::domain::credits::{CreditAllocation, CreditLot, SourcePriority};
use crate::domain::ids::LotId;

/// One draw against (or restoration into) a single lot. Amounts are positive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LotDraw {
    pub lot_id: LotId,
    pub amount: i64,
}

/// A debit plan covering the full requested amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebitPlan {
    pub draws: Vec<LotDraw>,
}

impl DebitPlan {
    pub fn total(&self) -> i64 {
        self.draws.iter().map(|draw| draw.amount).sum()
    }
}

/// The active balance cannot cover the requested amount.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("insufficient credits: need {required}, available {available}")]
pub struct ShortBalance {
    pub required: i64,
    pub available: i64,
}

/// Plan a debit of `amount` across the user's lots.
///
/// Lots are consumed in `(priority_rank(source), expires_at asc nulls last,
/// lot_id asc)` order; only active lots (unexpired, remaining > 0) take part.
pub fn plan_debit(
    lots: &[CreditLot],
    amount: i64,
    priority: &SourcePriority,
    now: DateTime<Utc>,
) -> Result<DebitPlan, ShortBalance> {
    let mut active: Vec<&CreditLot> = lots.iter().filter(|lot| lot.is_active(now)).collect();
    active.sort_by(|a, b| {
        priority
            .rank(a.source)
            .cmp(&priority.rank(b.source))
            .then_with(|| match (a.expires_at, b.expires_at) {
                (Some(left), Some(right)) => left.cmp(&right),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
            .then_with(|| a.id.cmp(&b.id))
    });

    let available: i64 = active.iter().map(|lot| lot.amount_remaining).sum();
    if available < amount {
        return Err(ShortBalance {
            required: amount,
            available,
        });
    }

    let mut remaining = amount;
    let mut draws = Vec::new();
    for lot in active {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(lot.amount_remaining);
        draws.push(LotDraw {
            lot_id: lot.id,
            amount: take,
        });
        remaining -= take;
    }

    Ok(DebitPlan { draws })
}

/// Plan a refund that restores a debit's draws to the exact lots it touched.
///
/// Debit allocations carry negative amounts; the plan restores their absolute
/// values, capped at `to_refund`, in allocation order.
pub fn plan_refund(debit_allocations: &[CreditAllocation], to_refund: i64) -> Vec<LotDraw> {
    let mut remaining = to_refund;
    let mut draws = Vec::new();
    for allocation in debit_allocations {
        if remaining == 0 {
            break;
        }
        let restore = allocation.amount.abs().min(remaining);
        if restore > 0 {
            draws.push(LotDraw {
                lot_id: allocation.lot_id,
                amount: restore,
            });
            remaining -= restore;
        }
    }
    draws
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::credits::CreditSource;
    use crate::domain::ids::{TxId, UserId};
    use chrono::TimeZone;
    use rstest::rstest;

    fn day(offset: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 8, 0, 0)
            .single()
            .expect("valid time")
            + chrono::Duration::days(offset)
    }

    fn lot(
        source: CreditSource,
        remaining: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> CreditLot {
        CreditLot {
            id: LotId::random(),
            user_id: UserId::random(),
            source,
            amount_granted: remaining,
            amount_remaining: remaining,
            expires_at,
            created_at: day(-30),
        }
    }

    #[rstest]
    fn consumes_sources_in_priority_order() {
        let event = lot(CreditSource::Event, 2, Some(day(1)));
        let monthly = lot(CreditSource::Monthly, 5, Some(day(7)));
        let free = lot(CreditSource::Free, 10, None);
        let lots = vec![free.clone(), monthly.clone(), event.clone()];

        let plan =
            plan_debit(&lots, 4, &SourcePriority::default(), day(0)).expect("plan succeeds");

        assert_eq!(
            plan.draws,
            vec![
                LotDraw { lot_id: event.id, amount: 2 },
                LotDraw { lot_id: monthly.id, amount: 2 },
            ]
        );
        assert_eq!(plan.total(), 4);
    }

    #[rstest]
    fn within_a_source_soonest_expiry_wins_and_unexpiring_lots_go_last() {
        let soon = lot(CreditSource::Free, 3, Some(day(1)));
        let later = lot(CreditSource::Free, 3, Some(day(5)));
        let never = lot(CreditSource::Free, 3, None);
        let lots = vec![never.clone(), later.clone(), soon.clone()];

        let plan =
            plan_debit(&lots, 7, &SourcePriority::default(), day(0)).expect("plan succeeds");

        assert_eq!(
            plan.draws,
            vec![
                LotDraw { lot_id: soon.id, amount: 3 },
                LotDraw { lot_id: later.id, amount: 3 },
                LotDraw { lot_id: never.id, amount: 1 },
            ]
        );
    }

    #[rstest]
    fn expired_and_drained_lots_are_skipped() {
        let expired = lot(CreditSource::Event, 5, Some(day(-1)));
        let mut drained = lot(CreditSource::Event, 5, None);
        drained.amount_remaining = 0;
        let live = lot(CreditSource::Free, 2, None);
        let lots = vec![expired, drained, live.clone()];

        let plan =
            plan_debit(&lots, 2, &SourcePriority::default(), day(0)).expect("plan succeeds");

        assert_eq!(plan.draws, vec![LotDraw { lot_id: live.id, amount: 2 }]);
    }

    #[rstest]
    fn reports_available_balance_when_short() {
        let lots = vec![lot(CreditSource::Free, 1, None)];

        let err = plan_debit(&lots, 3, &SourcePriority::default(), day(0))
            .expect_err("plan must fail");

        assert_eq!(err, ShortBalance { required: 3, available: 1 });
    }

    #[rstest]
    fn refund_restores_the_same_lots() {
        let first = LotId::random();
        let second = LotId::random();
        let tx = TxId::random();
        let allocations = vec![
            CreditAllocation { tx_id: tx, lot_id: first, amount: -2 },
            CreditAllocation { tx_id: tx, lot_id: second, amount: -2 },
        ];

        let draws = plan_refund(&allocations, 4);

        assert_eq!(
            draws,
            vec![
                LotDraw { lot_id: first, amount: 2 },
                LotDraw { lot_id: second, amount: 2 },
            ]
        );
    }

    #[rstest]
    fn partial_refund_stops_at_the_requested_amount() {
        let tx = TxId::random();
        let allocations = vec![
            CreditAllocation { tx_id: tx, lot_id: LotId::random(), amount: -3 },
            CreditAllocation { tx_id: tx, lot_id: LotId::random(), amount: -3 },
        ];

        let draws = plan_refund(&allocations, 4);

        assert_eq!(draws[0].amount, 3);
        assert_eq!(draws[1].amount, 1);
    }
}
