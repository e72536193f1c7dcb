use crate::ledger::Side;

/// A stake row as it exists inside the settlement transaction, before any
/// payout has been applied.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SettledStake {
    pub(crate) user_id: i64,
    pub(crate) amount_cents: i64,
    pub(crate) side: Side,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Won { share_cents: i64 },
    Lost { forfeited_cents: i64 },
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PayoutLine {
    pub(crate) user_id: i64,
    pub(crate) credit_cents: i64,
    pub(crate) outcome: Outcome,
}

#[derive(Debug, Clone)]
pub(crate) struct PayoutPlan {
    pub(crate) lines: Vec<PayoutLine>,
    pub(crate) winning_pool_cents: i64,
    pub(crate) losing_pool_cents: i64,
}

fn proportional_share(amount_cents: i64, losing_pool_cents: i64, winning_pool_cents: i64) -> i64 {
    if winning_pool_cents <= 0 {
        return 0;
    }
    // i128 keeps amount * pool out of overflow range; truncation leaves
    // residual fractional cents with the house rather than redistributing.
    let share = (amount_cents as i128) * (losing_pool_cents as i128) / (winning_pool_cents as i128);
    share as i64
}

/// Pari-mutuel distribution: winners split the losing pool proportionally
/// to their own stake and get their principal back. When nobody staked the
/// winning side, every stake is refunded and no win/loss counter moves.
pub(crate) fn build_payout_plan(stakes: &[SettledStake], winning_side: Side) -> PayoutPlan {
    let winning_pool_cents: i64 = stakes
        .iter()
        .filter(|s| s.side == winning_side)
        .map(|s| s.amount_cents)
        .sum();
    let losing_pool_cents: i64 = stakes
        .iter()
        .filter(|s| s.side != winning_side)
        .map(|s| s.amount_cents)
        .sum();

    let lines = if winning_pool_cents == 0 {
        stakes
            .iter()
            .map(|s| PayoutLine {
                user_id: s.user_id,
                credit_cents: s.amount_cents,
                outcome: Outcome::Refunded,
            })
            .collect()
    } else {
        stakes
            .iter()
            .map(|s| {
                if s.side == winning_side {
                    let share = proportional_share(s.amount_cents, losing_pool_cents, winning_pool_cents);
                    PayoutLine {
                        user_id: s.user_id,
                        credit_cents: s.amount_cents + share,
                        outcome: Outcome::Won { share_cents: share },
                    }
                } else {
                    PayoutLine {
                        user_id: s.user_id,
                        credit_cents: 0,
                        outcome: Outcome::Lost { forfeited_cents: s.amount_cents },
                    }
                }
            })
            .collect()
    };

    PayoutPlan { lines, winning_pool_cents, losing_pool_cents }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stake(user_id: i64, amount_cents: i64, side: Side) -> SettledStake {
        SettledStake { user_id, amount_cents, side }
    }

    #[test]
    fn pari_mutuel_split_pays_principal_plus_proportional_share() {
        let stakes = [
            stake(1, 1_000, Side::Red),
            stake(2, 3_000, Side::Red),
            stake(3, 2_000, Side::Blue),
        ];
        let plan = build_payout_plan(&stakes, Side::Red);
        assert_eq!(plan.winning_pool_cents, 4_000);
        assert_eq!(plan.losing_pool_cents, 2_000);

        let a = plan.lines.iter().find(|l| l.user_id == 1).unwrap();
        assert_eq!(a.credit_cents, 1_500);
        assert_eq!(a.outcome, Outcome::Won { share_cents: 500 });

        let b = plan.lines.iter().find(|l| l.user_id == 2).unwrap();
        assert_eq!(b.credit_cents, 4_500);
        assert_eq!(b.outcome, Outcome::Won { share_cents: 1_500 });

        let c = plan.lines.iter().find(|l| l.user_id == 3).unwrap();
        assert_eq!(c.credit_cents, 0);
        assert_eq!(c.outcome, Outcome::Lost { forfeited_cents: 2_000 });
    }

    #[test]
    fn no_winning_stakes_refunds_everyone_without_stats() {
        let stakes = [stake(1, 1_000, Side::Blue), stake(2, 500, Side::Blue)];
        let plan = build_payout_plan(&stakes, Side::Red);
        assert_eq!(plan.winning_pool_cents, 0);
        for line in &plan.lines {
            assert_eq!(line.outcome, Outcome::Refunded);
        }
        assert_eq!(plan.lines.iter().map(|l| l.credit_cents).sum::<i64>(), 1_500);
    }

    #[test]
    fn residual_cents_truncate_toward_the_pool() {
        // 3 winners of 1 cent each over a losing pool of 1 cent: each share
        // truncates to zero, the odd cent is not redistributed.
        let stakes = [
            stake(1, 1, Side::Red),
            stake(2, 1, Side::Red),
            stake(3, 1, Side::Red),
            stake(4, 1, Side::Blue),
        ];
        let plan = build_payout_plan(&stakes, Side::Red);
        let credited: i64 = plan
            .lines
            .iter()
            .filter(|l| matches!(l.outcome, Outcome::Won { .. }))
            .map(|l| l.credit_cents)
            .sum();
        assert_eq!(credited, 3);
    }

    #[test]
    fn empty_stake_set_settles_to_an_empty_plan() {
        let plan = build_payout_plan(&[], Side::Blue);
        assert!(plan.lines.is_empty());
        assert_eq!(plan.winning_pool_cents, 0);
        assert_eq!(plan.losing_pool_cents, 0);
    }
}
