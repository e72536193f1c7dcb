use std::time::Instant;

use sqlx::PgPool;

use crate::ledger::{BetLedger, DrainedLedger, Side};
use crate::payout::{build_payout_plan, Outcome, SettledStake};

#[derive(Debug, Clone, Copy)]
pub(crate) struct SettleSummary {
    pub(crate) stakes_settled: usize,
    pub(crate) winning_pool_cents: i64,
    pub(crate) losing_pool_cents: i64,
}

/// Convert every ephemeral stake of the concluded match into a durable
/// row, debit balances, and pay winners — all inside one database
/// transaction. The ledger is drained up front (placements are already
/// rejected while the match is LOCKED) and restored untouched if the
/// transaction fails, so a partial settlement is never observable.
pub(crate) async fn settle_match(
    db: &PgPool,
    ledger: &BetLedger,
    match_id: &str,
    winning_side: Side,
) -> Result<SettleSummary, sqlx::Error> {
    let drained = ledger.drain();
    let started = Instant::now();
    match apply_settlement(db, match_id, winning_side, &drained).await {
        Ok(summary) => {
            eprintln!(
                "[settle] match_settled id={} stakes={} winner={} pool_win_cents={} pool_lose_cents={} elapsed_ms={}",
                match_id,
                summary.stakes_settled,
                winning_side.as_str(),
                summary.winning_pool_cents,
                summary.losing_pool_cents,
                started.elapsed().as_millis()
            );
            Ok(summary)
        }
        Err(e) => {
            eprintln!(
                "[settle] persist_failed id={} stakes={} error={}",
                match_id,
                drained.entries.len(),
                e
            );
            ledger.restore(drained);
            Err(e)
        }
    }
}

async fn apply_settlement(
    db: &PgPool,
    match_id: &str,
    winning_side: Side,
    drained: &DrainedLedger,
) -> Result<SettleSummary, sqlx::Error> {
    let mut tx = db.begin().await?;

    // The stake leaves the spendable balance here, not at placement time.
    let mut stakes = Vec::with_capacity(drained.entries.len());
    for (user_id, entry) in &drained.entries {
        let res = sqlx::query("UPDATE users SET balance_cents = balance_cents - $1 WHERE id = $2")
            .bind(entry.amount_cents)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        if res.rows_affected() != 1 {
            return Err(sqlx::Error::RowNotFound);
        }
        sqlx::query("INSERT INTO stakes (user_id, match_id, amount_cents, side) VALUES ($1, $2, $3, $4)")
            .bind(user_id)
            .bind(match_id)
            .bind(entry.amount_cents)
            .bind(entry.side.as_str())
            .execute(&mut *tx)
            .await?;
        stakes.push(SettledStake {
            user_id: *user_id,
            amount_cents: entry.amount_cents,
            side: entry.side,
        });
    }

    let plan = build_payout_plan(&stakes, winning_side);
    for line in &plan.lines {
        match line.outcome {
            Outcome::Won { share_cents } => {
                sqlx::query(
                    r#"
                    UPDATE users SET balance_cents = balance_cents + $1,
                        total_wins = total_wins + 1,
                        total_revenue_gained_cents = total_revenue_gained_cents + $2
                    WHERE id = $3
                    "#,
                )
                .bind(line.credit_cents)
                .bind(share_cents)
                .bind(line.user_id)
                .execute(&mut *tx)
                .await?;
            }
            Outcome::Lost { forfeited_cents } => {
                sqlx::query(
                    r#"
                    UPDATE users SET total_losses = total_losses + 1,
                        total_revenue_lost_cents = total_revenue_lost_cents + $1
                    WHERE id = $2
                    "#,
                )
                .bind(forfeited_cents)
                .bind(line.user_id)
                .execute(&mut *tx)
                .await?;
            }
            Outcome::Refunded => {
                sqlx::query("UPDATE users SET balance_cents = balance_cents + $1 WHERE id = $2")
                    .bind(line.credit_cents)
                    .bind(line.user_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
    }

    // Settlement for a match id runs at most once.
    let res = sqlx::query("UPDATE matches SET state = 'SETTLED' WHERE id = $1 AND state = 'LOCKED'")
        .bind(match_id)
        .execute(&mut *tx)
        .await?;
    if res.rows_affected() != 1 {
        return Err(sqlx::Error::RowNotFound);
    }

    tx.commit().await?;
    Ok(SettleSummary {
        stakes_settled: stakes.len(),
        winning_pool_cents: plan.winning_pool_cents,
        losing_pool_cents: plan.losing_pool_cents,
    })
}
