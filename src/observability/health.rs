//! Health check HTTP server
//!
//! Serves liveness, aggregate health, the metrics snapshot and a
//! storage-backed status view per process. The process view reads storage
//! directly and may trail the live run slightly.

use crate::observability::metrics::metrics;
use crate::persistence::{PersistenceError, PersistenceGateway};
use crate::session::SessionRegistry;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use warp::http::StatusCode;
use warp::Filter;

pub struct HealthServer {
    service_id: String,
    port: u16,
    gateway: PersistenceGateway,
    registry: Arc<SessionRegistry>,
    additional_checks: RwLock<HashMap<String, HealthCheck>>,
}

impl HealthServer {
    pub fn new<S: Into<String>>(
        service_id: S,
        port: u16,
        gateway: PersistenceGateway,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            port,
            gateway,
            registry,
            additional_checks: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_health_check(&self, name: String, check: HealthCheck) {
        self.additional_checks.write().await.insert(name, check);
    }

    pub async fn remove_health_check(&self, name: &str) {
        self.additional_checks.write().await.remove(name);
    }

    /// All routes, for serving or for `warp::test`
    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let with_server = {
            let server = self.clone();
            warp::any().map(move || server.clone())
        };

        // GET /health
        let health = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server.clone())
            .and_then(|server: Arc<HealthServer>| async move {
                let status = server.get_health_status().await;
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            });

        // GET /live
        let live = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        // GET /metrics
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        // GET /processes/{id}
        let process = warp::path!("processes" / String)
            .and(warp::get())
            .and(with_server)
            .and_then(|process_id: String, server: Arc<HealthServer>| async move {
                Ok::<_, Infallible>(server.process_status(&process_id).await)
            });

        health.or(live).or(metrics_route).or(process)
    }

    pub async fn start(self: Arc<Self>) {
        let routes = self.routes().with(warp::cors().allow_any_origin());
        tracing::info!(port = self.port, "Starting health server");
        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;
    }

    async fn process_status(&self, process_id: &str) -> warp::reply::WithStatus<warp::reply::Json> {
        match self.gateway.status(process_id).await {
            Ok(mut view) => {
                view.connection = self.registry.connection_of(process_id);
                warp::reply::with_status(warp::reply::json(&view), StatusCode::OK)
            }
            Err(PersistenceError::ProcessNotFound { .. }) => warp::reply::with_status(
                warp::reply::json(&ErrorResponse {
                    error: format!("Process {process_id} not found"),
                    timestamp: current_timestamp(),
                }),
                StatusCode::NOT_FOUND,
            ),
            Err(e) => warp::reply::with_status(
                warp::reply::json(&ErrorResponse {
                    error: format!("Status lookup failed: {e}"),
                    timestamp: current_timestamp(),
                }),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        }
    }

    async fn get_health_status(&self) -> HealthStatus {
        let mut checks = HashMap::new();
        checks.insert("storage".to_string(), self.check_storage().await);
        checks.insert("sessions".to_string(), self.check_sessions());
        for (name, check) in self.additional_checks.read().await.iter() {
            checks.insert(name.clone(), check.clone());
        }

        let healthy = checks.values().all(|check| check.status == "healthy");
        metrics().update_health_status(healthy);

        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: current_timestamp(),
            service_id: self.service_id.clone(),
            uptime_seconds: metrics().get_metrics().uptime_seconds,
            checks,
        }
    }

    async fn check_storage(&self) -> HealthCheck {
        match self.gateway.exists("health-probe").await {
            Ok(_) => HealthCheck::healthy("Storage reachable"),
            Err(e) => HealthCheck {
                status: "unhealthy".to_string(),
                message: Some(format!("Storage probe failed: {e}")),
                last_check: current_timestamp(),
            },
        }
    }

    fn check_sessions(&self) -> HealthCheck {
        HealthCheck::healthy(format!("{} live sessions", self.registry.len()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    pub fn healthy<S: Into<String>>(message: S) -> Self {
        Self {
            status: "healthy".to_string(),
            message: Some(message.into()),
            last_check: current_timestamp(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    service_id: String,
    uptime_seconds: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
