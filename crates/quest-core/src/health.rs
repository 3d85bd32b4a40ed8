use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use chrono::Utc;

/// Liveness marker for background loops.
///
/// The loop calls [`Heartbeat::beat`] after each successful pass; readiness
/// fails once no beat has been seen for `stale_after`.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    last_beat_ms: Arc<AtomicI64>,
    stale_after: Duration,
}

impl Heartbeat {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            last_beat_ms: Arc::new(AtomicI64::new(0)),
            stale_after,
        }
    }

    pub fn beat(&self) {
        self.last_beat_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn is_fresh(&self) -> bool {
        let last = self.last_beat_ms.load(Ordering::Relaxed);
        if last == 0 {
            return false;
        }
        let age_ms = Utc::now().timestamp_millis().saturating_sub(last);
        u128::try_from(age_ms).unwrap_or(0) <= self.stale_after.as_millis()
    }
}

/// `GET /healthz`: the process is up.
pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// `GET /readyz`: 200 while the heartbeat is fresh, 503 otherwise.
pub async fn readyz(State(heartbeat): State<Heartbeat>) -> StatusCode {
    if heartbeat.is_fresh() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub fn health_router(heartbeat: Heartbeat) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(heartbeat)
}
