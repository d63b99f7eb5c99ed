//! HTTP surface consumed by the dashboard: the device list with aggregate
//! counts, and a liveness endpoint.

use std::sync::Arc;

use axum::{extract::State, response::Json};
use serde::Serialize;

use crate::presence::{self, Device, DeviceStatus};
use crate::websocket::RelayState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicesResponse {
    pub devices: Vec<Device>,
    pub total_devices: usize,
    pub online_devices: usize,
    pub offline_devices: usize,
}

/// GET /api/devices - Device list with aggregate counts
pub async fn list_devices(State(state): State<Arc<RelayState>>) -> Json<DevicesResponse> {
    let devices = presence::device_list(&state);
    let online = devices
        .iter()
        .filter(|device| device.status == DeviceStatus::Online)
        .count();
    Json(DevicesResponse {
        total_devices: devices.len(),
        online_devices: online,
        offline_devices: devices.len() - online,
        devices,
    })
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    uptime_seconds: u64,
    agents: usize,
    browsers: usize,
    sessions: usize,
}

/// GET /health - Health check endpoint
pub async fn health_check(State(state): State<Arc<RelayState>>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        uptime_seconds: state.started_at.elapsed().as_secs(),
        agents: state.registry.agent_count(),
        browsers: state.registry.browser_count(),
        sessions: state.sessions.len().await,
    })
}
