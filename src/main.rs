use std::convert::Infallible;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use futures::Stream;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};

mod broadcast;
mod config;
mod error;
mod ledger;
mod lifecycle;
mod matchdata;
mod payout;
mod settle;
mod stakes;
mod state;
mod store;
mod tasks;

use crate::broadcast::TotalsBroadcast;
use crate::config::load_config;
use crate::error::ApiError;
use crate::ledger::{BetLedger, Side};
use crate::lifecycle::MatchLifecycle;
use crate::matchdata::HttpBoutFeed;
use crate::stakes::StakeBook;
use crate::state::AppState;
use crate::store::{MatchRow, UserAccount};
use crate::tasks::{conclude_match, open_next_match};

const USER_ID_HEADER: &str = "x-user-id";

fn cents_to_decimal(cents: i64) -> Decimal {
    (Decimal::from(cents) / Decimal::from(100)).round_dp(2)
}

fn parse_amount_to_cents(amount: &str) -> Result<i64, ApiError> {
    let d = Decimal::from_str(amount)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "Invalid amount"))?;
    if d <= Decimal::ZERO {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Invalid amount"));
    }
    let cents = (d.round_dp(2) * Decimal::from(100)).to_i64().unwrap_or(0);
    if cents <= 0 {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Invalid amount"));
    }
    Ok(cents)
}

fn parse_side(side: &str) -> Result<Side, ApiError> {
    Side::parse(side).ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "Invalid side"))
}

/// The upstream identity layer authenticates the caller and injects the
/// resolved user id; this service only loads the durable account.
async fn current_user(state: &AppState, headers: &HeaderMap) -> Result<UserAccount, ApiError> {
    let raw = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "Not authenticated"))?;
    let user_id = raw
        .parse::<i64>()
        .map_err(|_| ApiError::new(StatusCode::UNAUTHORIZED, "Not authenticated"))?;
    store::load_user(&state.db, user_id)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("db error: {e}")))?
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "Unknown user"))
}

fn match_json(m: &MatchRow) -> serde_json::Value {
    serde_json::json!({
        "id": m.id,
        "external_id": m.external_id,
        "red_fighter": m.red_fighter,
        "blue_fighter": m.blue_fighter,
        "winning_side": m.winning_side.map(|s| s.as_str()),
        "state": m.state.as_str(),
        "created_at": m.created_at,
    })
}

// ===== HTTP handlers =====

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    sqlx::query("SELECT 1")
        .fetch_one(&state.db)
        .await
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, format!("db error: {e}")))?;
    Ok(Json(serde_json::json!({"status": "healthy", "database": "connected"})))
}

async fn get_current_match(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let m = store::current_match(&state.db)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("db error: {e}")))?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "No match yet"))?;
    let totals = state.stakes.current_totals();
    Ok(Json(serde_json::json!({
        "match": match_json(&m),
        "totals": {
            "red_total": cents_to_decimal(totals.red_cents),
            "blue_total": cents_to_decimal(totals.blue_cents),
        }
    })))
}

#[derive(Debug, Deserialize)]
struct MatchTransitionRequest {
    winner: Option<String>,
}

async fn create_next_match(
    State(state): State<AppState>,
    Json(req): Json<MatchTransitionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let manual = match req.winner.as_deref() {
        Some(s) => Some(parse_side(s)?),
        None => None,
    };
    let created = open_next_match(&state, manual).await.map_err(ApiError::from)?;
    Ok(Json(match_json(&created)))
}

async fn end_match(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
    Json(req): Json<MatchTransitionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let manual = match req.winner.as_deref() {
        Some(s) => Some(parse_side(s)?),
        None => None,
    };
    let settled = conclude_match(&state, &match_id, manual)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(match_json(&settled)))
}

#[derive(Debug, Deserialize)]
struct PlaceStakeRequest {
    amount: String,
    side: String,
}

async fn place_stake(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PlaceStakeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = current_user(&state, &headers).await?;
    let amount_cents = parse_amount_to_cents(&req.amount)?;
    let side = parse_side(&req.side)?;
    state
        .stakes
        .place_stake(&user, amount_cents, side)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(serde_json::json!({"success": true})))
}

#[derive(Debug, Deserialize)]
struct CancelStakeRequest {
    amount: String,
}

async fn cancel_stake(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CancelStakeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = current_user(&state, &headers).await?;
    let amount_cents = parse_amount_to_cents(&req.amount)?;
    state
        .stakes
        .cancel_stake(&user, amount_cents)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(serde_json::json!({"success": true})))
}

async fn get_my_stake(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = current_user(&state, &headers).await?;
    // While the window is open the only record is the ephemeral entry;
    // durable rows appear once settlement has run.
    if let Some(entry) = state.stakes.open_stake_of(user.id) {
        return Ok(Json(serde_json::json!({
            "status": "OPEN",
            "amount": cents_to_decimal(entry.amount_cents),
            "side": entry.side.as_str(),
        })));
    }
    let settled = state
        .stakes
        .settled_stake_of(user.id)
        .await
        .map_err(ApiError::from)?;
    match settled {
        Some(s) => Ok(Json(serde_json::json!({
            "status": "SETTLED",
            "amount": cents_to_decimal(s.amount_cents),
            "side": s.side.as_str(),
            "match_id": s.match_id,
        }))),
        None => Ok(Json(serde_json::json!({"status": "NONE"}))),
    }
}

async fn list_match_stakes(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let m = store::match_by_id(&state.db, &match_id)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("db error: {e}")))?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Match not found"))?;
    let rows = store::stakes_for_match(&state.db, &m.id)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("db error: {e}")))?;
    let items: Vec<serde_json::Value> = rows
        .iter()
        .map(|s| {
            serde_json::json!({
                "id": s.id,
                "user_id": s.user_id,
                "amount": cents_to_decimal(s.amount_cents),
                "side": s.side.as_str(),
                "created_at": s.created_at,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({
        "match_id": m.id,
        "count": items.len(),
        "items": items,
    })))
}

async fn get_totals(State(state): State<AppState>) -> Json<serde_json::Value> {
    let totals = state.stakes.current_totals();
    Json(serde_json::json!({
        "red_total": cents_to_decimal(totals.red_cents),
        "blue_total": cents_to_decimal(totals.blue_cents),
    }))
}

async fn stream_totals(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.broadcast.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(snapshot) => {
                    let payload = serde_json::json!({
                        "red_total": cents_to_decimal(snapshot.red_cents),
                        "blue_total": cents_to_decimal(snapshot.blue_cents),
                    });
                    let event = Event::default().event("totals").data(payload.to_string());
                    return Some((Ok::<Event, Infallible>(event), rx));
                }
                // Lagged receivers skip straight to the newest snapshot.
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn get_my_account(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = current_user(&state, &headers).await?;
    Ok(Json(serde_json::json!({
        "id": user.id,
        "username": user.username,
        "balance": cents_to_decimal(user.balance_cents),
        "total_wins": user.total_wins,
        "total_losses": user.total_losses,
        "total_revenue_gained": cents_to_decimal(user.total_revenue_gained_cents),
        "total_revenue_lost": cents_to_decimal(user.total_revenue_lost_cents),
        "created_at": user.created_at,
    })))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Arc::new(load_config()?);

    let db = PgPoolOptions::new()
        .min_connections(cfg.database.min_pool_size)
        .max_connections(cfg.database.max_pool_size)
        .acquire_timeout(Duration::from_secs(cfg.database.acquire_timeout_seconds))
        .max_lifetime(Duration::from_secs(cfg.database.max_lifetime_seconds))
        .connect(&cfg.database.url)
        .await
        .context("failed to connect to postgres")?;

    let ledger = Arc::new(BetLedger::new());
    let totals_broadcast = Arc::new(TotalsBroadcast::new(Arc::clone(&ledger)));
    let feed = Arc::new(HttpBoutFeed::new(&cfg.feed).context("failed to build match feed client")?);
    let stakes = Arc::new(StakeBook::new(
        db.clone(),
        Arc::clone(&ledger),
        Arc::clone(&totals_broadcast),
    ));
    let lifecycle = Arc::new(MatchLifecycle::new(
        db.clone(),
        feed,
        Arc::clone(&ledger),
        Arc::clone(&totals_broadcast),
    ));

    let state = AppState {
        cfg: cfg.clone(),
        db,
        broadcast: totals_broadcast,
        stakes,
        lifecycle,
        finalize_timers: Arc::new(DashMap::new()),
    };

    let allowed_headers = [AUTHORIZATION, CONTENT_TYPE, ACCEPT];
    let allowed_methods = [Method::GET, Method::POST, Method::OPTIONS];
    let cors = if cfg.api.cors_origins.iter().any(|x| x == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    } else {
        let origins: Vec<HeaderValue> = cfg
            .api
            .cors_origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/matches/current", get(get_current_match))
        .route("/matches/next", post(create_next_match))
        .route("/matches/{match_id}/end", post(end_match))
        .route("/matches/{match_id}/stakes", get(list_match_stakes))
        .route("/stakes", post(place_stake))
        .route("/stakes/cancel", post(cancel_stake))
        .route("/stakes/me", get(get_my_stake))
        .route("/totals", get(get_totals))
        .route("/totals/stream", get(stream_totals))
        .route("/users/me", get(get_my_account))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", cfg.api.host, cfg.api.port).parse()?;
    eprintln!("[startup] listening addr={}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
