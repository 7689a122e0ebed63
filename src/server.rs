use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use discovery_core::prelude::*;
use discovery_core::readiness::Ready;
use discovery_core::signal::Shutdown;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::kv::{Kv, sync};
use crate::store::{self, Store};
use crate::types::{ReachabilityResult, Runtime, Workload, WorkloadType};

type ApiError = (StatusCode, Json<Value>);

fn bad_request(message: String) -> ApiError {
	(StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found(message: String) -> ApiError {
	(StatusCode::NOT_FOUND, Json(json!({ "error": message })))
}

/// Query server: read-only. Rebuilds the in-memory index from the KV store,
/// keeps it current through the watch loop, and answers reachability
/// queries from it.
pub async fn run(config: Config) -> anyhow::Result<()> {
	let store = Store::new();
	let kv = Kv::connect(&config.etcd)
		.await
		.context("failed to connect to the KV store")?;

	let ready = Ready::new();
	let rebuilt = ready.register_task("initial index rebuild");
	let token = CancellationToken::new();
	let sync_task = tokio::spawn(sync::run(store.clone(), kv, token.clone(), rebuilt));

	let app = App {
		store,
		ready,
	};
	let listener = tokio::net::TcpListener::bind(config.server.bind_addr())
		.await
		.with_context(|| format!("failed to bind {}", config.server.bind_addr()))?;
	info!(addr = %config.server.bind_addr(), "query server listening");

	let shutdown = Shutdown::new();
	axum::serve(listener, app.router())
		.with_graceful_shutdown(async move { shutdown.wait().await })
		.await?;

	token.cancel();
	let _ = sync_task.await;
	info!("query server stopped");
	Ok(())
}

#[derive(Clone)]
pub struct App {
	store: Store,
	ready: Ready,
}

impl App {
	pub fn new(store: Store, ready: Ready) -> Self {
		App { store, ready }
	}

	pub fn router(&self) -> Router {
		Router::new()
			.route("/discover", get(discover_handler))
			.route("/reachable", get(discover_handler))
			.route("/workloads", get(list_handler))
			.route("/workloads/{id}", get(get_handler))
			.route("/healthz", get(health_handler))
			.route("/readyz", get(ready_handler))
			.route("/stats", get(stats_handler))
			.with_state(self.clone())
	}
}

#[derive(Deserialize)]
struct DiscoverParams {
	/// Caller identity: hostname, name, id, or id prefix.
	from: Option<String>,
	runtime: Option<String>,
	#[serde(rename = "type")]
	workload_type: Option<String>,
}

async fn discover_handler(
	State(app): State<App>,
	Query(params): Query<DiscoverParams>,
) -> Result<Json<ReachabilityResult>, ApiError> {
	let from = params
		.from
		.filter(|f| !f.is_empty())
		.ok_or_else(|| bad_request("missing 'from' parameter (workload id or hostname)".into()))?;
	let runtime = parse_filter::<Runtime>(params.runtime, "runtime")?;
	let workload_type = parse_filter::<WorkloadType>(params.workload_type, "type")?;

	let result = app.store.find_reachable(&from).map_err(|e| match e {
		store::Error::NotFound(identity) => not_found(format!("unknown workload: {identity}")),
	})?;

	// Filters narrow the result set after evaluation.
	let reachable: Vec<Workload> = result
		.reachable
		.into_iter()
		.filter(|w| runtime.is_none_or(|r| w.runtime == r))
		.filter(|w| workload_type.is_none_or(|t| w.workload_type == t))
		.collect();
	Ok(Json(ReachabilityResult::new(result.caller, reachable)))
}

#[derive(Deserialize)]
struct ListParams {
	runtime: Option<String>,
	group: Option<String>,
}

async fn list_handler(
	State(app): State<App>,
	Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
	let runtime = parse_filter::<Runtime>(params.runtime, "runtime")?;
	let mut workloads = app.store.list_all(runtime, None);
	if let Some(group) = params.group.filter(|g| !g.is_empty()) {
		workloads.retain(|w| w.isolation_groups.iter().any(|g| g.as_str() == group));
	}
	Ok(Json(json!({
		"count": workloads.len(),
		"workloads": workloads,
	})))
}

async fn get_handler(
	State(app): State<App>,
	Path(id): Path<String>,
) -> Result<Json<Workload>, ApiError> {
	app.store
		.get(&id)
		.map(Json)
		.ok_or_else(|| not_found(format!("workload not found: {id}")))
}

async fn health_handler() -> Json<Value> {
	Json(json!({ "status": "healthy" }))
}

async fn ready_handler(State(app): State<App>) -> Result<Json<Value>, ApiError> {
	if app.ready.is_ready() {
		Ok(Json(json!({ "status": "ready" })))
	} else {
		Err((
			StatusCode::SERVICE_UNAVAILABLE,
			Json(json!({ "status": "pending", "awaiting": app.ready.pending() })),
		))
	}
}

async fn stats_handler(State(app): State<App>) -> Json<Value> {
	let stats = app.store.stats();
	Json(json!({
		"total_workloads": stats.workloads,
		"isolation_groups": stats.isolation_groups,
		"by_runtime": stats.by_runtime,
		"by_type": stats.by_type,
	}))
}

fn parse_filter<T: std::str::FromStr<Err = String>>(
	raw: Option<String>,
	what: &str,
) -> Result<Option<T>, ApiError> {
	match raw.filter(|r| !r.is_empty()) {
		None => Ok(None),
		Some(raw) => raw
			.parse::<T>()
			.map(Some)
			.map_err(|_| bad_request(format!("invalid {what}: {raw:?}"))),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn workload(id: &str, name: &str, groups: &[&str]) -> Workload {
		Workload {
			id: strng::new(id),
			name: strng::new(name),
			hostname: strng::format!("{id}host"),
			runtime: Runtime::Docker,
			isolation_groups: groups.iter().map(strng::new).collect(),
			addresses: groups.iter().map(|g| strng::format!("{name}.{g}")).collect(),
			..Default::default()
		}
	}

	fn app_with_fixture() -> App {
		let store = Store::new();
		for w in [
			workload("w1", "api", &["netA"]),
			workload("w2", "db", &["netA", "netB"]),
			workload("w3", "cache", &["netB"]),
		] {
			store.update(w.id.clone(), w);
		}
		App::new(store, Ready::new())
	}

	async fn get_body(app: &App, uri: &str) -> (StatusCode, Value) {
		use tower::ServiceExt;

		let response = app
			.router()
			.oneshot(
				axum::http::Request::builder()
					.uri(uri)
					.body(axum::body::Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		let status = response.status();
		let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
			.await
			.unwrap();
		let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
		(status, value)
	}

	#[tokio::test]
	async fn discover_projects_and_counts() {
		let app = app_with_fixture();
		let (status, body) = get_body(&app, "/discover?from=w1host").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["caller"]["id"], "w1");
		assert_eq!(body["count"], 1);
		assert_eq!(body["reachable"][0]["id"], "w2");
		assert_eq!(body["reachable"][0]["addresses"], json!(["db.netA"]));
	}

	#[tokio::test]
	async fn discover_requires_from() {
		let app = app_with_fixture();
		let (status, _) = get_body(&app, "/discover").await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
	}

	#[tokio::test]
	async fn discover_unknown_identity_is_404() {
		let app = app_with_fixture();
		let (status, body) = get_body(&app, "/reachable?from=ghost").await;
		assert_eq!(status, StatusCode::NOT_FOUND);
		assert!(body["error"].as_str().unwrap().contains("ghost"));
	}

	#[tokio::test]
	async fn discover_rejects_bad_runtime_filter() {
		let app = app_with_fixture();
		let (status, _) = get_body(&app, "/discover?from=w1host&runtime=vmware").await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
	}

	#[tokio::test]
	async fn workloads_listing_and_group_filter() {
		let app = app_with_fixture();
		let (status, body) = get_body(&app, "/workloads").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["count"], 3);

		let (_, body) = get_body(&app, "/workloads?group=netB").await;
		assert_eq!(body["count"], 2);
	}

	#[tokio::test]
	async fn workload_by_id() {
		let app = app_with_fixture();
		let (status, body) = get_body(&app, "/workloads/w2").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["name"], "db");

		let (status, _) = get_body(&app, "/workloads/ghost").await;
		assert_eq!(status, StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn readiness_flips_when_rebuild_completes() {
		let store = Store::new();
		let ready = Ready::new();
		let block = ready.register_task("initial index rebuild");
		let app = App::new(store, ready);

		let (status, _) = get_body(&app, "/readyz").await;
		assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

		drop(block);
		let (status, _) = get_body(&app, "/readyz").await;
		assert_eq!(status, StatusCode::OK);
	}

	#[tokio::test]
	async fn stats_counts() {
		let app = app_with_fixture();
		let (status, body) = get_body(&app, "/stats").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["total_workloads"], 3);
		assert_eq!(body["isolation_groups"], 2);
		assert_eq!(body["by_runtime"]["docker"], 3);
	}
}
