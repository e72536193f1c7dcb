use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One of the two corners a stake can be placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum Side {
    Red,
    Blue,
}

impl Side {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Side::Red => "RED",
            Side::Blue => "BLUE",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Side> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RED" => Some(Side::Red),
            "BLUE" => Some(Side::Blue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ActiveStake {
    pub(crate) amount_cents: i64,
    pub(crate) side: Side,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) struct SideTotals {
    pub(crate) red_cents: i64,
    pub(crate) blue_cents: i64,
}

/// Everything taken out of the ledger in one settlement pass.
#[derive(Debug)]
pub(crate) struct DrainedLedger {
    pub(crate) entries: Vec<(i64, ActiveStake)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub(crate) enum LedgerError {
    #[error("no active stake")]
    NoStake,
    #[error("cancel amount exceeds active stake")]
    InsufficientStake,
    #[error("insufficient funds")]
    InsufficientFunds,
}

#[derive(Debug, Default)]
struct LedgerInner {
    entries: HashMap<i64, ActiveStake>,
    red_cents: i64,
    blue_cents: i64,
}

impl LedgerInner {
    fn total_mut(&mut self, side: Side) -> &mut i64 {
        match side {
            Side::Red => &mut self.red_cents,
            Side::Blue => &mut self.blue_cents,
        }
    }
}

/// In-process stake ledger for the currently open match.
///
/// Every operation runs start-to-finish under one lock, so the
/// read-modify-write of a user entry and the matching aggregate adjustment
/// are never partially visible to concurrent callers.
#[derive(Debug, Default)]
pub(crate) struct BetLedger {
    inner: Mutex<LedgerInner>,
}

impl BetLedger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add `amount_cents` to the caller's entry on `side`.
    ///
    /// The funds check runs against `balance_cents` inside the same locked
    /// step as the write, so two in-flight placements by one user cannot
    /// both pass against a stale reserved figure. Switching sides moves the
    /// previously reserved amount to the new side's aggregate; the user
    /// keeps the accumulated amount.
    pub(crate) fn atomic_place(
        &self,
        user_id: i64,
        side: Side,
        amount_cents: i64,
        balance_cents: i64,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock();
        let existing = inner.entries.get(&user_id).copied();
        let reserved = existing.map(|e| e.amount_cents).unwrap_or(0);
        if balance_cents - reserved < amount_cents {
            return Err(LedgerError::InsufficientFunds);
        }
        if let Some(prev) = existing {
            if prev.side != side {
                *inner.total_mut(prev.side) -= prev.amount_cents;
                *inner.total_mut(side) += prev.amount_cents;
            }
        }
        *inner.total_mut(side) += amount_cents;
        inner
            .entries
            .entry(user_id)
            .and_modify(|e| {
                e.amount_cents += amount_cents;
                e.side = side;
            })
            .or_insert(ActiveStake { amount_cents, side });
        Ok(())
    }

    /// Release `amount_cents` of the caller's entry. The key is removed on
    /// an exact-zero remainder; the aggregate of the entry's recorded side
    /// shrinks by the same amount.
    pub(crate) fn atomic_cancel(&self, user_id: i64, amount_cents: i64) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock();
        let entry = match inner.entries.get(&user_id).copied() {
            Some(e) => e,
            None => return Err(LedgerError::NoStake),
        };
        if amount_cents > entry.amount_cents {
            return Err(LedgerError::InsufficientStake);
        }
        *inner.total_mut(entry.side) -= amount_cents;
        if amount_cents == entry.amount_cents {
            inner.entries.remove(&user_id);
        } else if let Some(e) = inner.entries.get_mut(&user_id) {
            e.amount_cents -= amount_cents;
        }
        Ok(())
    }

    pub(crate) fn side_totals(&self) -> SideTotals {
        let inner = self.inner.lock();
        SideTotals { red_cents: inner.red_cents, blue_cents: inner.blue_cents }
    }

    pub(crate) fn entry_of(&self, user_id: i64) -> Option<ActiveStake> {
        self.inner.lock().entries.get(&user_id).copied()
    }

    /// Take every entry and zero both aggregates in one locked step.
    pub(crate) fn drain(&self) -> DrainedLedger {
        let mut inner = self.inner.lock();
        let entries: Vec<(i64, ActiveStake)> = inner.entries.drain().collect();
        inner.red_cents = 0;
        inner.blue_cents = 0;
        DrainedLedger { entries }
    }

    /// Put a drained set back after a failed settlement write so no stake
    /// is lost. Placements are rejected while the match is locked, so the
    /// ledger is empty when this runs.
    pub(crate) fn restore(&self, drained: DrainedLedger) {
        let mut inner = self.inner.lock();
        for (user_id, stake) in drained.entries {
            *inner.total_mut(stake.side) += stake.amount_cents;
            inner.entries.insert(user_id, stake);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_sum(ledger: &BetLedger) -> i64 {
        ledger.inner.lock().entries.values().map(|e| e.amount_cents).sum()
    }

    #[test]
    fn place_and_cancel_conserve_totals() {
        let ledger = BetLedger::new();
        ledger.atomic_place(1, Side::Red, 500, 10_000).unwrap();
        ledger.atomic_place(2, Side::Blue, 300, 10_000).unwrap();
        ledger.atomic_place(1, Side::Red, 200, 10_000).unwrap();
        ledger.atomic_cancel(2, 100).unwrap();

        let totals = ledger.side_totals();
        assert_eq!(totals.red_cents, 700);
        assert_eq!(totals.blue_cents, 200);
        assert_eq!(totals.red_cents + totals.blue_cents, entry_sum(&ledger));
    }

    #[test]
    fn place_rejects_over_balance() {
        let ledger = BetLedger::new();
        ledger.atomic_place(1, Side::Red, 800, 1_000).unwrap();
        let err = ledger.atomic_place(1, Side::Red, 300, 1_000).unwrap_err();
        assert_eq!(err, LedgerError::InsufficientFunds);
        // Rejected call left nothing behind.
        assert_eq!(ledger.side_totals().red_cents, 800);
        assert_eq!(ledger.entry_of(1).unwrap().amount_cents, 800);
    }

    #[test]
    fn cancel_more_than_staked_never_mutates() {
        let ledger = BetLedger::new();
        ledger.atomic_place(1, Side::Blue, 500, 10_000).unwrap();
        let err = ledger.atomic_cancel(1, 600).unwrap_err();
        assert_eq!(err, LedgerError::InsufficientStake);
        assert_eq!(ledger.entry_of(1).unwrap().amount_cents, 500);
        assert_eq!(ledger.side_totals().blue_cents, 500);
    }

    #[test]
    fn full_cancel_removes_entry() {
        let ledger = BetLedger::new();
        ledger.atomic_place(1, Side::Red, 500, 10_000).unwrap();
        ledger.atomic_cancel(1, 500).unwrap();
        assert!(ledger.entry_of(1).is_none());
        assert_eq!(ledger.side_totals(), SideTotals { red_cents: 0, blue_cents: 0 });
        assert_eq!(ledger.atomic_cancel(1, 100).unwrap_err(), LedgerError::NoStake);
    }

    #[test]
    fn cancel_without_entry_fails() {
        let ledger = BetLedger::new();
        assert_eq!(ledger.atomic_cancel(42, 100).unwrap_err(), LedgerError::NoStake);
    }

    #[test]
    fn side_switch_accumulates_and_moves_aggregate() {
        let ledger = BetLedger::new();
        ledger.atomic_place(1, Side::Red, 1_000, 10_000).unwrap();
        ledger.atomic_place(1, Side::Blue, 500, 10_000).unwrap();

        let entry = ledger.entry_of(1).unwrap();
        assert_eq!(entry.amount_cents, 1_500);
        assert_eq!(entry.side, Side::Blue);

        let totals = ledger.side_totals();
        assert_eq!(totals.red_cents, 0);
        assert_eq!(totals.blue_cents, 1_500);

        ledger.atomic_cancel(1, 1_500).unwrap();
        assert_eq!(ledger.side_totals(), SideTotals { red_cents: 0, blue_cents: 0 });
    }

    #[test]
    fn drain_takes_everything_and_restore_puts_it_back() {
        let ledger = BetLedger::new();
        ledger.atomic_place(1, Side::Red, 1_000, 10_000).unwrap();
        ledger.atomic_place(2, Side::Blue, 2_000, 10_000).unwrap();

        let drained = ledger.drain();
        assert_eq!(drained.entries.len(), 2);
        assert_eq!(ledger.side_totals(), SideTotals { red_cents: 0, blue_cents: 0 });
        assert!(ledger.entry_of(1).is_none());

        ledger.restore(drained);
        assert_eq!(ledger.side_totals().red_cents, 1_000);
        assert_eq!(ledger.side_totals().blue_cents, 2_000);
        assert_eq!(ledger.entry_of(2).unwrap().amount_cents, 2_000);
    }
}
