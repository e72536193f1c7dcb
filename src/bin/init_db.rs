use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::Row;

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id BIGSERIAL PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        balance_cents BIGINT NOT NULL DEFAULT 0,
        total_wins BIGINT NOT NULL DEFAULT 0,
        total_losses BIGINT NOT NULL DEFAULT 0,
        total_revenue_gained_cents BIGINT NOT NULL DEFAULT 0,
        total_revenue_lost_cents BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS matches (
        id TEXT PRIMARY KEY,
        external_id TEXT,
        red_fighter TEXT NOT NULL,
        blue_fighter TEXT NOT NULL,
        winning_side TEXT,
        state TEXT NOT NULL DEFAULT 'OPEN',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stakes (
        id BIGSERIAL PRIMARY KEY,
        user_id BIGINT NOT NULL REFERENCES users (id),
        match_id TEXT NOT NULL REFERENCES matches (id),
        amount_cents BIGINT NOT NULL CHECK (amount_cents > 0),
        side TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS stakes_match_user_idx ON stakes (match_id, user_id)",
    "CREATE INDEX IF NOT EXISTS matches_created_at_idx ON matches (created_at DESC)",
];

#[tokio::main]
async fn main() -> Result<()> {
    let db_url = env_required("DATABASE_URL")?;
    let min = env_u32("DB_MIN_POOL_SIZE", 2).max(1);
    let max = env_u32("DB_MAX_POOL_SIZE", 10).max(min);
    let acquire = env_u64("DB_ACQUIRE_TIMEOUT_SECONDS", 30).max(5);
    let seed_users = env_list("SEED_USERS", &[]);
    let seed_balance_cents = env_i64("SEED_BALANCE_CENTS", 100_000);

    let db = PgPoolOptions::new()
        .min_connections(min)
        .max_connections(max)
        .acquire_timeout(Duration::from_secs(acquire))
        .connect(&db_url)
        .await
        .context("connect postgres")?;

    for stmt in SCHEMA_STATEMENTS {
        sqlx::query(stmt)
            .execute(&db)
            .await
            .with_context(|| format!("exec schema stmt: {}", stmt.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("<empty>")))?;
    }

    let mut seeded = 0usize;
    for username in &seed_users {
        let row = sqlx::query(
            "INSERT INTO users (username, balance_cents) VALUES ($1, $2) ON CONFLICT (username) DO NOTHING RETURNING id",
        )
        .bind(username)
        .bind(seed_balance_cents)
        .fetch_optional(&db)
        .await?;
        if let Some(r) = row {
            let id: i64 = r.get("id");
            eprintln!("[init_db] seeded_user id={} username={}", id, username);
            seeded += 1;
        }
    }

    println!("initialized: tables={}, seeded_users={}", SCHEMA_STATEMENTS.len(), seeded);
    Ok(())
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow!("missing required env var: {key}"))
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) => {
            let parts: Vec<String> = v
                .split(',')
                .map(|s| s.trim().trim_matches('"').to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if parts.is_empty() {
                default.iter().map(|s| (*s).to_string()).collect()
            } else {
                parts
            }
        }
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}
