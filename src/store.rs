use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::ledger::Side;

#[derive(Debug, Clone)]
pub(crate) struct UserAccount {
    pub(crate) id: i64,
    pub(crate) username: String,
    pub(crate) balance_cents: i64,
    pub(crate) total_wins: i64,
    pub(crate) total_losses: i64,
    pub(crate) total_revenue_gained_cents: i64,
    pub(crate) total_revenue_lost_cents: i64,
    pub(crate) created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MatchState {
    Open,
    Locked,
    Settled,
}

impl MatchState {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            MatchState::Open => "OPEN",
            MatchState::Locked => "LOCKED",
            MatchState::Settled => "SETTLED",
        }
    }

    fn parse(s: &str) -> Option<MatchState> {
        match s {
            "OPEN" => Some(MatchState::Open),
            "LOCKED" => Some(MatchState::Locked),
            "SETTLED" => Some(MatchState::Settled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MatchRow {
    pub(crate) id: String,
    pub(crate) external_id: Option<String>,
    pub(crate) red_fighter: String,
    pub(crate) blue_fighter: String,
    pub(crate) winning_side: Option<Side>,
    pub(crate) state: MatchState,
    pub(crate) created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub(crate) struct StakeRow {
    pub(crate) id: i64,
    pub(crate) user_id: i64,
    pub(crate) match_id: String,
    pub(crate) amount_cents: i64,
    pub(crate) side: Side,
    pub(crate) created_at: DateTime<Utc>,
}

fn decode_err(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

fn user_from_row(r: &PgRow) -> UserAccount {
    UserAccount {
        id: r.get("id"),
        username: r.get("username"),
        balance_cents: r.get("balance_cents"),
        total_wins: r.get("total_wins"),
        total_losses: r.get("total_losses"),
        total_revenue_gained_cents: r.get("total_revenue_gained_cents"),
        total_revenue_lost_cents: r.get("total_revenue_lost_cents"),
        created_at: r.get("created_at"),
    }
}

fn match_from_row(r: &PgRow) -> Result<MatchRow, sqlx::Error> {
    let state_raw: String = r.get("state");
    let state = MatchState::parse(&state_raw)
        .ok_or_else(|| decode_err(format!("unknown match state: {state_raw}")))?;
    let winning_raw: Option<String> = r.get("winning_side");
    let winning_side = match winning_raw {
        Some(s) => Some(
            Side::parse(&s).ok_or_else(|| decode_err(format!("unknown winning side: {s}")))?,
        ),
        None => None,
    };
    Ok(MatchRow {
        id: r.get("id"),
        external_id: r.get("external_id"),
        red_fighter: r.get("red_fighter"),
        blue_fighter: r.get("blue_fighter"),
        winning_side,
        state,
        created_at: r.get("created_at"),
    })
}

fn stake_from_row(r: &PgRow) -> Result<StakeRow, sqlx::Error> {
    let side_raw: String = r.get("side");
    let side = Side::parse(&side_raw)
        .ok_or_else(|| decode_err(format!("unknown stake side: {side_raw}")))?;
    Ok(StakeRow {
        id: r.get("id"),
        user_id: r.get("user_id"),
        match_id: r.get("match_id"),
        amount_cents: r.get("amount_cents"),
        side,
        created_at: r.get("created_at"),
    })
}

pub(crate) async fn load_user(db: &PgPool, user_id: i64) -> Result<Option<UserAccount>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, username, balance_cents, total_wins, total_losses,
               total_revenue_gained_cents, total_revenue_lost_cents, created_at
        FROM users WHERE id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(db)
    .await?;
    Ok(row.map(|r| user_from_row(&r)))
}

/// The current match is the most recently created one.
pub(crate) async fn current_match(db: &PgPool) -> Result<Option<MatchRow>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, external_id, red_fighter, blue_fighter, winning_side, state, created_at
        FROM matches ORDER BY created_at DESC, id DESC LIMIT 1
        "#,
    )
    .fetch_optional(db)
    .await?;
    row.map(|r| match_from_row(&r)).transpose()
}

pub(crate) async fn match_by_id(db: &PgPool, id: &str) -> Result<Option<MatchRow>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, external_id, red_fighter, blue_fighter, winning_side, state, created_at
        FROM matches WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(db)
    .await?;
    row.map(|r| match_from_row(&r)).transpose()
}

pub(crate) async fn insert_match(
    db: &PgPool,
    id: &str,
    red_fighter: &str,
    blue_fighter: &str,
) -> Result<MatchRow, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO matches (id, red_fighter, blue_fighter, state)
        VALUES ($1, $2, $3, 'OPEN')
        RETURNING id, external_id, red_fighter, blue_fighter, winning_side, state, created_at
        "#,
    )
    .bind(id)
    .bind(red_fighter)
    .bind(blue_fighter)
    .fetch_one(db)
    .await?;
    match_from_row(&row)
}

/// Record the winner and advance OPEN -> LOCKED. The state predicate keeps
/// a second conclusion attempt from ever passing.
pub(crate) async fn mark_locked(
    db: &PgPool,
    id: &str,
    winning_side: Side,
    external_id: Option<&str>,
) -> Result<(), sqlx::Error> {
    let res = sqlx::query(
        "UPDATE matches SET winning_side = $1, external_id = $2, state = 'LOCKED' WHERE id = $3 AND state = 'OPEN'",
    )
    .bind(winning_side.as_str())
    .bind(external_id)
    .bind(id)
    .execute(db)
    .await?;
    if res.rows_affected() != 1 {
        return Err(sqlx::Error::RowNotFound);
    }
    Ok(())
}

pub(crate) async fn stake_for(
    db: &PgPool,
    match_id: &str,
    user_id: i64,
) -> Result<Option<StakeRow>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, user_id, match_id, amount_cents, side, created_at FROM stakes WHERE match_id = $1 AND user_id = $2",
    )
    .bind(match_id)
    .bind(user_id)
    .fetch_optional(db)
    .await?;
    row.map(|r| stake_from_row(&r)).transpose()
}

pub(crate) async fn stakes_for_match(
    db: &PgPool,
    match_id: &str,
) -> Result<Vec<StakeRow>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, user_id, match_id, amount_cents, side, created_at FROM stakes WHERE match_id = $1 ORDER BY id",
    )
    .bind(match_id)
    .fetch_all(db)
    .await?;
    rows.iter().map(stake_from_row).collect()
}
