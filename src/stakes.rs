use std::sync::Arc;

use sqlx::PgPool;

use crate::broadcast::TotalsBroadcast;
use crate::error::StakeError;
use crate::ledger::{ActiveStake, BetLedger, Side, SideTotals};
use crate::store::{self, MatchState, StakeRow};

/// Smallest placeable amount; every stake must be an exact multiple.
pub(crate) const STAKE_INCREMENT_CENTS: i64 = 5;

pub(crate) fn validate_amount(amount_cents: i64) -> Result<(), StakeError> {
    if amount_cents <= 0 || amount_cents % STAKE_INCREMENT_CENTS != 0 {
        return Err(StakeError::InvalidAmount);
    }
    Ok(())
}

/// Place/cancel/query surface over the ephemeral ledger. Validation runs
/// here; the ledger op itself is the atomicity (and error) boundary.
pub(crate) struct StakeBook {
    db: PgPool,
    ledger: Arc<BetLedger>,
    broadcast: Arc<TotalsBroadcast>,
}

impl StakeBook {
    pub(crate) fn new(db: PgPool, ledger: Arc<BetLedger>, broadcast: Arc<TotalsBroadcast>) -> Self {
        Self { db, ledger, broadcast }
    }

    pub(crate) async fn place_stake(
        &self,
        user: &store::UserAccount,
        amount_cents: i64,
        side: Side,
    ) -> Result<(), StakeError> {
        validate_amount(amount_cents)?;
        let m = store::current_match(&self.db)
            .await?
            .ok_or(StakeError::NoOpenMatch)?;
        if m.state != MatchState::Open || m.winning_side.is_some() {
            return Err(StakeError::MatchLocked);
        }
        self.ledger
            .atomic_place(user.id, side, amount_cents, user.balance_cents)?;
        self.broadcast.publish();
        Ok(())
    }

    pub(crate) async fn cancel_stake(
        &self,
        user: &store::UserAccount,
        amount_cents: i64,
    ) -> Result<(), StakeError> {
        validate_amount(amount_cents)?;
        self.ledger.atomic_cancel(user.id, amount_cents)?;
        self.broadcast.publish();
        Ok(())
    }

    pub(crate) fn current_totals(&self) -> SideTotals {
        self.ledger.side_totals()
    }

    /// The ephemeral entry for the open window. While a match is open this
    /// is the only record of "my bet"; durable rows do not exist yet.
    pub(crate) fn open_stake_of(&self, user_id: i64) -> Option<ActiveStake> {
        self.ledger.entry_of(user_id)
    }

    /// The durable stake on the current match, present only once
    /// settlement has run.
    pub(crate) async fn settled_stake_of(&self, user_id: i64) -> Result<Option<StakeRow>, StakeError> {
        let Some(m) = store::current_match(&self.db).await? else {
            return Ok(None);
        };
        Ok(store::stake_for(&self.db, &m.id, user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_must_be_positive_increment_multiples() {
        assert!(validate_amount(5).is_ok());
        assert!(validate_amount(10).is_ok());
        assert!(validate_amount(1_000).is_ok());
        assert!(matches!(validate_amount(7), Err(StakeError::InvalidAmount)));
        assert!(matches!(validate_amount(0), Err(StakeError::InvalidAmount)));
        assert!(matches!(validate_amount(-5), Err(StakeError::InvalidAmount)));
        assert!(matches!(validate_amount(3), Err(StakeError::InvalidAmount)));
    }
}
