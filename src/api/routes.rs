use std::sync::Arc;

use alloy::primitives::{Address, B256};
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::health::HealthState;
use crate::error::AppError;
use crate::harvest::{HarvestScheduler, HarvestStatsSnapshot, SchedulerState};
use crate::query::QueryFacade;
use crate::state::PositionTracker;
use crate::types::{BribePoolView, HarvestOutcome, IndexedMarket, Position, MAX_OUTCOME};

#[derive(Clone)]
pub struct ApiState {
    pub query: Arc<QueryFacade>,
    pub scheduler: Arc<HarvestScheduler>,
    pub tracker: Arc<PositionTracker>,
    pub health: Arc<HealthState>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/markets", get(get_markets))
        .route("/markets/:id", get(get_market))
        .route("/bribes/:id/:outcome", get(get_bribes))
        .route("/harvest/:id/:outcome", post(post_harvest))
        .route("/harvest-all", post(post_harvest_all))
        .route("/health", get(get_health))
        .route("/stats/harvest", get(get_harvest_stats))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct MarketsQuery {
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// Bribe pool with 256-bit and timestamp fields as decimal strings.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BribePoolResponse {
    pub id: String,
    pub sponsor: Address,
    pub token: Address,
    pub total_amount: String,
    pub start_time: String,
    pub end_time: String,
    pub condition_id: B256,
    pub outcome: u8,
}

impl From<BribePoolView> for BribePoolResponse {
    fn from(p: BribePoolView) -> Self {
        Self {
            id: p.id.to_string(),
            sponsor: p.sponsor,
            token: p.token,
            total_amount: p.total_amount.to_string(),
            start_time: p.start_time.to_string(),
            end_time: p.end_time.to_string(),
            condition_id: p.condition_id,
            outcome: p.outcome,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestResponse {
    pub success: bool,
    pub amount_harvested: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<HarvestOutcome> for HarvestResponse {
    fn from(o: HarvestOutcome) -> Self {
        Self {
            success: o.success(),
            amount_harvested: o.amount_harvested().to_string(),
            status: o.status.to_string(),
            error: o.error().map(str::to_string),
        }
    }
}

#[derive(Serialize)]
pub struct HarvestAllResponse {
    pub accepted: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub subscription_live: bool,
    pub tracked_positions: usize,
    pub last_backfill_block: u64,
    pub live_logs_processed: u64,
    pub live_log_failures: u64,
    pub scheduler: SchedulerState,
}

// ---------------------------------------------------------------------------
// Path parsing
// ---------------------------------------------------------------------------

fn parse_condition_id(raw: &str) -> Result<B256, AppError> {
    raw.parse::<B256>()
        .map_err(|_| AppError::BadRequest(format!("`{raw}` is not a 32-byte hex condition id")))
}

fn parse_position(id: &str, outcome: &str) -> Result<Position, AppError> {
    let condition_id = parse_condition_id(id)?;
    let outcome: u8 = outcome
        .parse()
        .map_err(|_| AppError::BadRequest(format!("`{outcome}` is not an outcome index")))?;
    if outcome > MAX_OUTCOME {
        return Err(AppError::BadRequest(format!("outcome must be 0 or 1, got {outcome}")));
    }
    let position = Position::new(condition_id, outcome);
    if !position.is_well_formed() {
        return Err(AppError::BadRequest("condition id must be non-zero".to_string()));
    }
    Ok(position)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_markets(
    State(state): State<ApiState>,
    Query(params): Query<MarketsQuery>,
) -> Json<Vec<IndexedMarket>> {
    Json(state.query.list_markets(params.limit).await)
}

async fn get_market(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<IndexedMarket>, AppError> {
    let condition_id = parse_condition_id(&id)?;
    state
        .query
        .get_market(condition_id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("market {id}")))
}

/// The `x-bribes-available` header is `false` when the chain read failed and
/// the empty list means "unknown".
async fn get_bribes(
    State(state): State<ApiState>,
    Path((id, outcome)): Path<(String, String)>,
) -> Result<([(&'static str, &'static str); 1], Json<Vec<BribePoolResponse>>), AppError> {
    let position = parse_position(&id, &outcome)?;
    let result = state.query.get_bribe_pools(position).await;
    let available = if result.available { "true" } else { "false" };
    let pools = result.pools.into_iter().map(BribePoolResponse::from).collect();
    Ok(([("x-bribes-available", available)], Json(pools)))
}

async fn post_harvest(
    State(state): State<ApiState>,
    Path((id, outcome)): Path<(String, String)>,
) -> Result<Json<HarvestResponse>, AppError> {
    let position = parse_position(&id, &outcome)?;
    let outcome = state.scheduler.harvest_one(position).await?;
    Ok(Json(HarvestResponse::from(outcome)))
}

async fn post_harvest_all(State(state): State<ApiState>) -> Json<HarvestAllResponse> {
    Json(HarvestAllResponse {
        accepted: state.scheduler.spawn_trigger_now(),
    })
}

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        subscription_live: state.health.subscription_live(),
        tracked_positions: state.tracker.len(),
        last_backfill_block: state.health.last_backfill_block(),
        live_logs_processed: state.health.live_logs_processed(),
        live_log_failures: state.health.live_log_failures(),
        scheduler: state.scheduler.state(),
    })
}

async fn get_harvest_stats(State(state): State<ApiState>) -> Json<HarvestStatsSnapshot> {
    Json(state.scheduler.stats().snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, MemoryCacheStore};
    use crate::chain::mock::market_created_log;
    use crate::chain::MockChainClient;
    use crate::indexer::EventIndexer;
    use crate::types::condition_key;
    use alloy::primitives::U256;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn contract() -> Address {
        Address::repeat_byte(0xee)
    }

    struct Harness {
        chain: Arc<MockChainClient>,
        cache: Arc<dyn CacheStore>,
        state: ApiState,
    }

    fn harness() -> Harness {
        let chain = Arc::new(MockChainClient::new());
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
        let tracker = PositionTracker::new();
        let state = ApiState {
            query: Arc::new(QueryFacade::new(chain.clone(), cache.clone(), contract())),
            scheduler: HarvestScheduler::new(chain.clone(), tracker.clone(), contract()),
            tracker,
            health: Arc::new(HealthState::new()),
        };
        Harness { chain, cache, state }
    }

    async fn call(state: &ApiState, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router(state.clone())
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn index_market(h: &Harness, byte: u8) {
        let indexer = EventIndexer::new(
            h.chain.clone(),
            h.cache.clone(),
            h.state.tracker.clone(),
            contract(),
            h.state.health.clone(),
        );
        let log = market_created_log(
            contract(),
            B256::repeat_byte(byte),
            Address::repeat_byte(0x0c),
            B256::repeat_byte(0x0d),
            2,
            10,
            20,
            5,
        );
        indexer.persist(&log).await.unwrap();
    }

    #[tokio::test]
    async fn market_lookup_by_id() {
        let h = harness();
        index_market(&h, 0xaa).await;
        let id = condition_key(&B256::repeat_byte(0xaa));

        let (status, body) = call(&h.state, "GET", &format!("/markets/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["conditionId"], id);
        assert_eq!(body["outcomeSlotCount"], 2);

        let (status, _) = call(&h.state, "GET", &format!("/markets/{}", condition_key(&B256::repeat_byte(1)))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&h.state, "GET", "/markets/0x1234").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn market_list_respects_limit() {
        let h = harness();
        index_market(&h, 1).await;
        index_market(&h, 2).await;

        let (_, all) = call(&h.state, "GET", "/markets").await;
        assert_eq!(all.as_array().unwrap().len(), 2);
        let (_, one) = call(&h.state, "GET", "/markets?limit=1").await;
        assert_eq!(one.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bribes_render_numbers_as_strings() {
        let h = harness();
        let condition_id = B256::repeat_byte(0x33);
        h.chain.add_bribe_pool(BribePoolView {
            id: U256::from(4),
            sponsor: Address::repeat_byte(1),
            token: Address::repeat_byte(2),
            total_amount: U256::from(10).pow(U256::from(24)),
            start_time: 1_700_000_000,
            end_time: 1_700_086_400,
            condition_id,
            outcome: 1,
        });

        let (status, body) = call(&h.state, "GET", &format!("/bribes/{}/1", condition_key(&condition_id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], "4");
        assert_eq!(body[0]["totalAmount"], "1000000000000000000000000");
        assert_eq!(body[0]["startTime"], "1700000000");
        assert_eq!(body[0]["outcome"], 1);

        let (status, _) = call(&h.state, "GET", &format!("/bribes/{}/2", condition_key(&condition_id))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn single_harvest_reports_status() {
        let h = harness();
        let position = Position::new(B256::repeat_byte(0x44), 0);
        h.chain.set_pending(position, U256::from(50));
        let uri = format!("/harvest/{}/0", condition_key(&position.condition_id));

        let (status, body) = call(&h.state, "POST", &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["amountHarvested"], "50");
        assert_eq!(body["status"], "harvested");
        assert!(body.get("error").is_none());

        let (_, again) = call(&h.state, "POST", &uri).await;
        assert_eq!(again["success"], false);
        assert_eq!(again["status"], "nothing_pending");
    }

    #[tokio::test]
    async fn harvest_all_is_refused_while_a_cycle_runs() {
        let h = harness();
        let pos = Position::new(B256::repeat_byte(0x42), 0);
        h.state.tracker.insert(pos);
        h.chain.set_pending(pos, U256::from(8));
        let gate = h.chain.gate_pending_reads();

        let (status, body) = call(&h.state, "POST", "/harvest-all").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], true);

        let (status, body) = call(&h.state, "POST", "/harvest-all").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], false);

        gate.notify_one();
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while h.state.scheduler.state() == SchedulerState::Running {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.chain.harvest_calls(), 1);

        let (_, body) = call(&h.state, "POST", "/harvest-all").await;
        assert_eq!(body["accepted"], true);
        gate.notify_one();
    }

    #[tokio::test]
    async fn health_reports_tracker_and_scheduler() {
        let h = harness();
        h.state.tracker.insert(Position::new(B256::repeat_byte(9), 1));
        h.state.health.set_last_backfill_block(77);

        let (status, body) = call(&h.state, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["trackedPositions"], 1);
        assert_eq!(body["lastBackfillBlock"], 77);
        assert_eq!(body["scheduler"], "idle");
    }

    #[tokio::test]
    async fn harvest_stats_start_empty() {
        let h = harness();
        let (status, body) = call(&h.state, "GET", "/stats/harvest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cycles"], 0);
        assert!(body["lastCycle"].is_null());
    }
}
