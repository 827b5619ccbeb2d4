//! HTTP API of the coordinator
//!
//! Collection lifecycle, cluster setup and introspection, point writes with
//! a selectable ordering, reads with a selectable consistency, and a
//! Server-Sent Events stream of topology revisions.

use crate::cluster::{
    ClusterSetupRequest, CollectionParams, PeerId, PointId, PointOperation, PointStruct,
    ReadConsistency, SearchRequest, WriteOrdering, WriteRequest,
};
use crate::common::{parse_duration, Error};
use crate::coordinator::node::{ClusterNode, LocalCluster};
use async_stream::stream;
use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<LocalCluster>,
    /// Peer this API answers for
    pub peer_id: PeerId,
}

impl AppState {
    fn node(&self) -> Result<&ClusterNode, ApiError> {
        Ok(self.cluster.node(self.peer_id)?)
    }
}

/// [`Error`] rendered as a JSON response
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.to_http_status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        (
            status,
            Json(json!({ "status": "error", "error": self.0.to_string() })),
        )
            .into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn ok(result: impl serde::Serialize, started: Instant) -> ApiResult {
    Ok(Json(json!({
        "status": "ok",
        "result": result,
        "time": started.elapsed().as_secs_f64(),
    })))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/peers/:peer_id/heartbeat", post(heartbeat))
        .route("/collections", get(list_collections))
        .route(
            "/collections/:name",
            get(get_collection)
                .put(create_collection)
                .delete(delete_collection),
        )
        .route(
            "/collections/:name/cluster",
            get(cluster_info).post(cluster_setup),
        )
        .route(
            "/collections/:name/points",
            post(retrieve_points).put(upsert_points),
        )
        .route("/collections/:name/points/delete", post(delete_points))
        .route("/collections/:name/points/payload", post(set_payload))
        .route("/collections/:name/points/search", post(search_points))
        .route("/collections/:name/operations/:id", get(operation_status))
        .route("/collections/:name/watch", get(watch_revisions))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// === Node ===

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "peer_id": state.peer_id,
        "peers": state.cluster.peers(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, state.cluster.metrics.to_prometheus())
}

async fn heartbeat(State(state): State<AppState>, Path(peer_id): Path<PeerId>) -> ApiResult {
    let started = Instant::now();
    state.node()?.health.record_heartbeat(peer_id);
    ok(true, started)
}

// === Collections ===

#[derive(Debug, Deserialize)]
struct CreateCollection {
    #[serde(default = "one")]
    shard_number: u32,
    #[serde(default = "one")]
    replication_factor: u32,
    #[serde(default = "one")]
    write_consistency_factor: u32,
}

fn one() -> u32 {
    1
}

async fn list_collections(State(state): State<AppState>) -> ApiResult {
    let started = Instant::now();
    let names = state.node()?.store.list_collections()?;
    ok(json!({ "collections": names }), started)
}

async fn create_collection(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<CreateCollection>,
) -> ApiResult {
    let started = Instant::now();
    let params = CollectionParams {
        shard_number: body.shard_number,
        replication_factor: body.replication_factor,
        write_consistency_factor: body.write_consistency_factor,
    };
    state.node()?.admin.create_collection(&name, params).await?;
    ok(true, started)
}

async fn get_collection(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let started = Instant::now();
    let topology = state.node()?.store.get_topology(&name)?;
    ok(topology, started)
}

async fn delete_collection(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let started = Instant::now();
    state.node()?.admin.drop_collection(&name).await?;
    ok(true, started)
}

// === Cluster setup ===

#[derive(Debug, Deserialize)]
struct SetupParams {
    /// How long to wait for a started transfer: seconds, or "500ms", "2m"...
    timeout: Option<String>,
}

fn setup_timeout(raw: &str) -> Result<Duration, Error> {
    match raw.parse::<u64>() {
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(_) => parse_duration(raw),
    }
}

async fn cluster_info(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let started = Instant::now();
    let info = state.node()?.admin.cluster_info(&name).await?;
    ok(info, started)
}

async fn cluster_setup(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<SetupParams>,
    Json(request): Json<ClusterSetupRequest>,
) -> ApiResult {
    let started = Instant::now();
    let wait = params.timeout.as_deref().map(setup_timeout).transpose()?;
    let status = state.node()?.admin.submit(&name, request, wait).await?;
    Ok(Json(json!({
        "status": "ok",
        "result": true,
        "setup_status": status,
        "time": started.elapsed().as_secs_f64(),
    })))
}

// === Points ===

#[derive(Debug, Default, Deserialize)]
struct WriteParams {
    #[serde(default)]
    wait: bool,
    #[serde(default)]
    ordering: WriteOrdering,
    shard: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ReadParams {
    #[serde(default)]
    consistency: ReadConsistency,
}

#[derive(Debug, Deserialize)]
struct UpsertPoints {
    points: Vec<PointStruct>,
}

#[derive(Debug, Deserialize)]
struct PointIds {
    points: Vec<PointId>,
}

#[derive(Debug, Deserialize)]
struct SetPayloadBody {
    points: Vec<PointId>,
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct RetrievePoints {
    ids: Vec<PointId>,
}

async fn write(
    state: &AppState,
    collection: String,
    params: WriteParams,
    operation: PointOperation,
) -> ApiResult {
    let started = Instant::now();
    let result = state
        .node()?
        .writer
        .update(WriteRequest {
            collection,
            operation,
            ordering: params.ordering,
            wait: params.wait,
            shard: params.shard,
        })
        .await?;
    ok(result, started)
}

async fn upsert_points(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<WriteParams>,
    Json(body): Json<UpsertPoints>,
) -> ApiResult {
    write(&state, name, params, PointOperation::Upsert { points: body.points }).await
}

async fn delete_points(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<WriteParams>,
    Json(body): Json<PointIds>,
) -> ApiResult {
    write(&state, name, params, PointOperation::Delete { ids: body.points }).await
}

async fn set_payload(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<WriteParams>,
    Json(body): Json<SetPayloadBody>,
) -> ApiResult {
    let operation = PointOperation::SetPayload {
        ids: body.points,
        payload: body.payload,
    };
    write(&state, name, params, operation).await
}

async fn retrieve_points(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<ReadParams>,
    Json(body): Json<RetrievePoints>,
) -> ApiResult {
    let started = Instant::now();
    let records = state
        .node()?
        .reader
        .retrieve(&name, &body.ids, params.consistency)
        .await?;
    ok(records, started)
}

async fn search_points(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<ReadParams>,
    Json(request): Json<SearchRequest>,
) -> ApiResult {
    let started = Instant::now();
    let hits = state
        .node()?
        .reader
        .search(&name, &request, params.consistency)
        .await?;
    ok(hits, started)
}

async fn operation_status(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, u64)>,
) -> ApiResult {
    let started = Instant::now();
    match state.node()?.writer.operation_status(&name, id) {
        Some(status) => ok(json!({ "operation_id": id, "status": status }), started),
        None => Err(ApiError(Error::BadRequest(format!(
            "operation {} of {} is unknown or expired",
            id, name
        )))),
    }
}

// === Watch ===

/// SSE stream of topology revisions, starting with the current one
async fn watch_revisions(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let mut revisions = state.node()?.store.subscribe_revisions(&name)?;
    let stream = stream! {
        loop {
            let revision = *revisions.borrow_and_update();
            yield Ok(Event::default().event("revision").data(revision.to_string()));
            if revisions.changed().await.is_err() {
                break;
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Config;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn router() -> Router {
        let mut config = Config::default();
        config.node.peer_id = 1;
        config.node.peers = vec![2, 3];
        let cluster = Arc::new(LocalCluster::new(&config).unwrap());
        create_router(AppState {
            cluster,
            peer_id: 1,
        })
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_collection_write_and_read() {
        let router = router();
        let (status, _) = send(
            &router,
            "PUT",
            "/collections/docs",
            json!({"shard_number": 2, "replication_factor": 3}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &router,
            "PUT",
            "/collections/docs/points?wait=true",
            json!({"points": [{"id": 1, "vector": [1.0, 0.0]}, {"id": 2, "vector": [0.0, 1.0]}]}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["status"], "completed");

        let (status, body) = send(
            &router,
            "POST",
            "/collections/docs/points?consistency=all",
            json!({"ids": [1, 2, 3]}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"].as_array().unwrap().len(), 2);

        let (_, body) = send(&router, "GET", "/collections/docs/cluster", Value::Null).await;
        assert_eq!(body["result"]["shard_count"], 2);
        assert_eq!(body["result"]["peer_id"], 1);
    }

    #[tokio::test]
    async fn test_errors_map_to_status() {
        let router = router();
        let (status, body) = send(&router, "GET", "/collections/missing", Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "error");

        send(&router, "PUT", "/collections/docs", json!({})).await;
        let (_, info) = send(&router, "GET", "/collections/docs/cluster", Value::Null).await;
        let holder = match info["result"]["remote_shards"].as_array() {
            Some(remote) if !remote.is_empty() => remote[0]["peer_id"].as_u64().unwrap(),
            _ => 1,
        };
        let (status, _) = send(
            &router,
            "POST",
            "/collections/docs/cluster",
            json!({"drop_replica": {"shard_id": 0, "peer_id": holder}}),
        )
        .await;
        // Single replica: dropping it would leave the shard empty
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &router,
            "POST",
            "/collections/docs/cluster?timeout=400000000000000000m",
            json!({"drop_replica": {"shard_id": 0, "peer_id": holder}}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");

        let (status, _) = send(
            &router,
            "PUT",
            "/collections/docs/points?wait=true&ordering=strong",
            json!({"points": [{"id": 1, "vector": [1.0]}]}),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let router = router();
        let request = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("minivec_topology_commits_total"));
    }
}
