use crate::latency::{LatencyProbe, ProbeKind, ProbeSnapshot};
use crate::publisher::{SensorStatus, StatusBoard};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError};

#[derive(Clone)]
pub struct HttpState {
    pub node_id: String,
    pub probe: Arc<LatencyProbe>,
    pub sensors: StatusBoard,
}

#[derive(Debug, Serialize)]
struct NetworkStatus {
    probe_kind: ProbeKind,
    probe_target: String,
    #[serde(flatten)]
    snapshot: ProbeSnapshot,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    node_id: String,
    network: NetworkStatus,
    sensors: BTreeMap<String, SensorStatus>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusResponse> {
    let snapshot = state.probe.snapshot();
    let sensors = state
        .sensors
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(id, status)| (id.clone(), status.clone()))
        .collect();

    Json(StatusResponse {
        node_id: state.node_id.clone(),
        network: NetworkStatus {
            probe_kind: state.probe.target().kind,
            probe_target: state.probe.target().to_string(),
            snapshot,
        },
        sensors,
    })
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .with_state(state)
}
