use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::broadcast::TotalsBroadcast;
use crate::error::LifecycleError;
use crate::ledger::{BetLedger, Side};
use crate::matchdata::BoutFeed;
use crate::settle::settle_match;
use crate::store::{self, MatchRow, MatchState};

/// Content-derived match identity: both fighters plus the feed's freshness
/// marker. The format is shared with persisted data and must not change.
pub(crate) fn bout_token(red: &str, blue: &str, freshness: &str) -> String {
    format!("{red}-{blue}-{freshness}")
}

/// Two tokens denote the same pairing when their first two
/// hyphen-delimited fields agree; the freshness field is informational
/// and ignored for comparison.
pub(crate) fn same_bout(a: &str, b: &str) -> bool {
    let mut a_parts = a.splitn(3, '-');
    let mut b_parts = b.splitn(3, '-');
    a_parts.next() == b_parts.next() && a_parts.next() == b_parts.next()
}

fn side_for_winner(m: &MatchRow, winner: &str) -> Result<Side, LifecycleError> {
    if winner == m.red_fighter {
        Ok(Side::Red)
    } else if winner == m.blue_fighter {
        Ok(Side::Blue)
    } else {
        Err(LifecycleError::CorruptWinnerMapping {
            match_id: m.id.clone(),
            winner: winner.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
struct ResolvedWinner {
    side: Side,
    external_id: Option<String>,
}

/// Walk the feed's bout sequence to find the concluded bout for `m`.
///
/// First try the bout following the last one we consumed; if its pairing
/// does not match, fall back to the feed's most recent bout. The cursor is
/// advanced as results are consumed and reverted when resolution fails, so
/// a later automatic attempt is not short-circuited.
async fn resolve_winner_with(
    feed: &dyn BoutFeed,
    cursor: &mut Option<String>,
    m: &MatchRow,
    manual: Option<Side>,
) -> Result<ResolvedWinner, LifecycleError> {
    let prev = cursor.clone();

    if let Some(last) = prev.as_deref() {
        if let Some(b) = feed.bout_after(last).await? {
            *cursor = Some(b.id.clone());
            if same_bout(&m.id, &bout_token(&b.red, &b.blue, &b.id)) {
                if let Some(winner) = b.winner.as_deref() {
                    return Ok(ResolvedWinner {
                        side: side_for_winner(m, winner)?,
                        external_id: Some(b.id),
                    });
                }
            }
        }
    }

    if let Some(b) = feed.most_recent_bout().await? {
        *cursor = Some(b.id.clone());
        if same_bout(&m.id, &bout_token(&b.red, &b.blue, &b.id)) {
            if let Some(winner) = b.winner.as_deref() {
                return Ok(ResolvedWinner {
                    side: side_for_winner(m, winner)?,
                    external_id: Some(b.id),
                });
            }
        }
    }

    if let Some(side) = manual {
        // Manual conclusion carries no external result fields.
        return Ok(ResolvedWinner { side, external_id: None });
    }

    *cursor = prev;
    Err(LifecycleError::UnresolvedWinner)
}

#[derive(Debug, Clone)]
pub(crate) struct MatchCreated {
    pub(crate) created: MatchRow,
    pub(crate) ended: Option<MatchRow>,
}

/// Owns the OPEN -> LOCKED -> SETTLED progression of the current match.
/// A single gate serializes transitions, so settlement of one match always
/// completes (or fully aborts) before the next match can open.
pub(crate) struct MatchLifecycle {
    db: PgPool,
    feed: Arc<dyn BoutFeed>,
    ledger: Arc<BetLedger>,
    broadcast: Arc<TotalsBroadcast>,
    last_seen_bout: Mutex<Option<String>>,
    gate: Mutex<()>,
}

impl MatchLifecycle {
    pub(crate) fn new(
        db: PgPool,
        feed: Arc<dyn BoutFeed>,
        ledger: Arc<BetLedger>,
        broadcast: Arc<TotalsBroadcast>,
    ) -> Self {
        Self {
            db,
            feed,
            ledger,
            broadcast,
            last_seen_bout: Mutex::new(None),
            gate: Mutex::new(()),
        }
    }

    /// Open a match for the bout currently live on the feed. An unchanged
    /// freshness token means the feed has not advanced yet and yields
    /// `DuplicateMatch` (retry later, not fatal). A still-open current
    /// match is ended (and settled) first.
    pub(crate) async fn create_next_match(
        &self,
        manual_winner: Option<Side>,
    ) -> Result<MatchCreated, LifecycleError> {
        let _gate = self.gate.lock().await;

        let bout = self.feed.current_bout().await?;
        let token = bout_token(&bout.red, &bout.blue, &bout.freshness);
        if store::match_by_id(&self.db, &token).await?.is_some() {
            return Err(LifecycleError::DuplicateMatch);
        }

        // A LOCKED current match means a prior settlement attempt failed and
        // its stakes were restored into the ledger; it must settle before a
        // new match can take the ledger over.
        let mut ended = None;
        if let Some(current) = store::current_match(&self.db).await? {
            if current.state != MatchState::Settled {
                ended = Some(self.end_match_locked(current, manual_winner).await?);
            }
        }

        let created = store::insert_match(&self.db, &token, &bout.red, &bout.blue).await?;
        eprintln!(
            "[lifecycle] match_opened id={} red={} blue={}",
            created.id, created.red_fighter, created.blue_fighter
        );
        Ok(MatchCreated { created, ended })
    }

    pub(crate) async fn end_match(
        &self,
        match_id: &str,
        manual_winner: Option<Side>,
    ) -> Result<MatchRow, LifecycleError> {
        let _gate = self.gate.lock().await;
        let m = store::match_by_id(&self.db, match_id)
            .await?
            .ok_or(LifecycleError::NotFound)?;
        self.end_match_locked(m, manual_winner).await
    }

    async fn end_match_locked(
        &self,
        m: MatchRow,
        manual_winner: Option<Side>,
    ) -> Result<MatchRow, LifecycleError> {
        let side = match (m.state, m.winning_side) {
            (MatchState::Settled, _) => return Err(LifecycleError::AlreadyConcluded),
            // Winner already recorded but settlement did not commit; retry
            // it with the recorded winner instead of re-resolving.
            (MatchState::Locked, Some(side)) => {
                eprintln!("[lifecycle] settlement_retry id={} winner={}", m.id, side.as_str());
                side
            }
            (MatchState::Locked, None) => return Err(LifecycleError::AlreadyConcluded),
            (MatchState::Open, Some(_)) => return Err(LifecycleError::AlreadyConcluded),
            (MatchState::Open, None) => {
                let resolved = {
                    let mut cursor = self.last_seen_bout.lock().await;
                    resolve_winner_with(self.feed.as_ref(), &mut cursor, &m, manual_winner).await?
                };
                store::mark_locked(&self.db, &m.id, resolved.side, resolved.external_id.as_deref())
                    .await?;
                resolved.side
            }
        };

        settle_match(&self.db, &self.ledger, &m.id, side).await?;
        // Subscribers see the drained (zero) totals without waiting for the
        // next placement.
        self.broadcast.publish();

        let settled = store::match_by_id(&self.db, &m.id)
            .await?
            .ok_or(LifecycleError::NotFound)?;
        eprintln!(
            "[lifecycle] match_concluded id={} winner={} external_id={:?}",
            settled.id,
            side.as_str(),
            settled.external_id
        );
        Ok(settled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchdata::{Bout, CurrentBout, FeedError};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex as SyncMutex;

    struct StubFeed {
        current: CurrentBout,
        after: SyncMutex<Option<Bout>>,
        latest: SyncMutex<Option<Bout>>,
    }

    impl StubFeed {
        fn new() -> Self {
            Self {
                current: CurrentBout {
                    red: "ryu".into(),
                    blue: "ken".into(),
                    freshness: "t1".into(),
                },
                after: SyncMutex::new(None),
                latest: SyncMutex::new(None),
            }
        }
    }

    #[async_trait]
    impl BoutFeed for StubFeed {
        async fn current_bout(&self) -> Result<CurrentBout, FeedError> {
            Ok(self.current.clone())
        }
        async fn bout_after(&self, _id: &str) -> Result<Option<Bout>, FeedError> {
            Ok(self.after.lock().clone())
        }
        async fn most_recent_bout(&self) -> Result<Option<Bout>, FeedError> {
            Ok(self.latest.lock().clone())
        }
    }

    fn match_row(id: &str, red: &str, blue: &str) -> MatchRow {
        MatchRow {
            id: id.to_string(),
            external_id: None,
            red_fighter: red.to_string(),
            blue_fighter: blue.to_string(),
            winning_side: None,
            state: MatchState::Open,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn token_format_and_pairing_equality() {
        let token = bout_token("ryu", "ken", "20240101");
        assert_eq!(token, "ryu-ken-20240101");
        assert!(same_bout("ryu-ken-20240101", "ryu-ken-20240215"));
        assert!(!same_bout("ryu-ken-20240101", "ryu-chun-20240101"));
        assert!(!same_bout("ryu-ken-20240101", "ken-ryu-20240101"));
    }

    #[test]
    fn unchanged_freshness_reproduces_the_same_id() {
        // An unadvanced feed yields the exact token already persisted, which
        // is what the duplicate pre-check (and the primary key) trips on.
        let first = bout_token("ryu", "ken", "t1");
        let second = bout_token("ryu", "ken", "t1");
        assert_eq!(first, second);
        assert_ne!(first, bout_token("ryu", "ken", "t2"));
    }

    #[test]
    fn winner_must_map_to_a_fighter() {
        let m = match_row("ryu-ken-t1", "ryu", "ken");
        assert_eq!(side_for_winner(&m, "ryu").unwrap(), Side::Red);
        assert_eq!(side_for_winner(&m, "ken").unwrap(), Side::Blue);
        assert!(matches!(
            side_for_winner(&m, "akuma"),
            Err(LifecycleError::CorruptWinnerMapping { .. })
        ));
    }

    #[tokio::test]
    async fn winner_resolves_from_the_next_bout_in_sequence() {
        let feed = StubFeed::new();
        *feed.after.lock() = Some(Bout {
            id: "b42".into(),
            red: "ryu".into(),
            blue: "ken".into(),
            winner: Some("ken".into()),
        });
        let m = match_row("ryu-ken-t1", "ryu", "ken");
        let mut cursor = Some("b41".to_string());

        let resolved = resolve_winner_with(&feed, &mut cursor, &m, None).await.unwrap();
        assert_eq!(resolved.side, Side::Blue);
        assert_eq!(resolved.external_id.as_deref(), Some("b42"));
        assert_eq!(cursor.as_deref(), Some("b42"));
    }

    #[tokio::test]
    async fn mismatched_sequence_falls_back_to_most_recent() {
        let feed = StubFeed::new();
        *feed.after.lock() = Some(Bout {
            id: "b42".into(),
            red: "guile".into(),
            blue: "blanka".into(),
            winner: Some("guile".into()),
        });
        *feed.latest.lock() = Some(Bout {
            id: "b43".into(),
            red: "ryu".into(),
            blue: "ken".into(),
            winner: Some("ryu".into()),
        });
        let m = match_row("ryu-ken-t1", "ryu", "ken");
        let mut cursor = Some("b41".to_string());

        let resolved = resolve_winner_with(&feed, &mut cursor, &m, None).await.unwrap();
        assert_eq!(resolved.side, Side::Red);
        assert_eq!(resolved.external_id.as_deref(), Some("b43"));
        assert_eq!(cursor.as_deref(), Some("b43"));
    }

    #[tokio::test]
    async fn unresolved_winner_reverts_the_cursor() {
        let feed = StubFeed::new();
        *feed.after.lock() = Some(Bout {
            id: "b42".into(),
            red: "guile".into(),
            blue: "blanka".into(),
            winner: Some("guile".into()),
        });
        *feed.latest.lock() = Some(Bout {
            id: "b43".into(),
            red: "guile".into(),
            blue: "blanka".into(),
            winner: Some("guile".into()),
        });
        let m = match_row("ryu-ken-t1", "ryu", "ken");
        let mut cursor = Some("b41".to_string());

        let err = resolve_winner_with(&feed, &mut cursor, &m, None).await.unwrap_err();
        assert!(matches!(err, LifecycleError::UnresolvedWinner));
        assert_eq!(cursor.as_deref(), Some("b41"));
    }

    #[tokio::test]
    async fn manual_winner_overrides_when_feed_disagrees() {
        let feed = StubFeed::new();
        *feed.latest.lock() = Some(Bout {
            id: "b43".into(),
            red: "guile".into(),
            blue: "blanka".into(),
            winner: Some("guile".into()),
        });
        let m = match_row("ryu-ken-t1", "ryu", "ken");
        let mut cursor = None;

        let resolved = resolve_winner_with(&feed, &mut cursor, &m, Some(Side::Blue))
            .await
            .unwrap();
        assert_eq!(resolved.side, Side::Blue);
        assert!(resolved.external_id.is_none());
    }

    #[tokio::test]
    async fn unconcluded_bout_does_not_resolve() {
        let feed = StubFeed::new();
        *feed.latest.lock() = Some(Bout {
            id: "b43".into(),
            red: "ryu".into(),
            blue: "ken".into(),
            winner: None,
        });
        let m = match_row("ryu-ken-t1", "ryu", "ken");
        let mut cursor = None;

        let err = resolve_winner_with(&feed, &mut cursor, &m, None).await.unwrap_err();
        assert!(matches!(err, LifecycleError::UnresolvedWinner));
        assert!(cursor.is_none());
    }
}
