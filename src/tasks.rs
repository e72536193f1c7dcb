use std::time::Duration;

use crate::error::LifecycleError;
use crate::ledger::Side;
use crate::state::AppState;
use crate::store::MatchRow;

/// Arm the fallback conclusion task for a match. One pending task per
/// match id; re-arming replaces the previous one instead of stacking.
pub(crate) fn arm_finalize_timer(state: &AppState, match_id: &str) {
    cancel_finalize_timer(state, match_id);
    let delay = Duration::from_secs(state.cfg.betting.auto_finalize_seconds);
    let s = state.clone();
    let id = match_id.to_string();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        s.finalize_timers.remove(&id);
        match s.lifecycle.end_match(&id, None).await {
            Ok(m) => eprintln!(
                "[finalize] auto_concluded id={} winner={:?}",
                m.id,
                m.winning_side.map(|s| s.as_str())
            ),
            // Left for a later attempt: the next create/end call or an
            // operator conclusion picks the match up again.
            Err(e) => eprintln!("[finalize] auto_conclude_failed id={} error={}", id, e),
        }
    });
    state.finalize_timers.insert(match_id.to_string(), handle.abort_handle());
}

pub(crate) fn cancel_finalize_timer(state: &AppState, match_id: &str) {
    if let Some((_, handle)) = state.finalize_timers.remove(match_id) {
        handle.abort();
    }
}

/// Open the next match and keep the timer registry in step: the replaced
/// match's pending task is cancelled, the new match gets a fresh one.
pub(crate) async fn open_next_match(
    state: &AppState,
    manual_winner: Option<Side>,
) -> Result<MatchRow, LifecycleError> {
    let out = state.lifecycle.create_next_match(manual_winner).await?;
    if let Some(ended) = &out.ended {
        cancel_finalize_timer(state, &ended.id);
    }
    arm_finalize_timer(state, &out.created.id);
    Ok(out.created)
}

pub(crate) async fn conclude_match(
    state: &AppState,
    match_id: &str,
    manual_winner: Option<Side>,
) -> Result<MatchRow, LifecycleError> {
    let m = state.lifecycle.end_match(match_id, manual_winner).await?;
    cancel_finalize_timer(state, match_id);
    Ok(m)
}
