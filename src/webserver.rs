use axum::extract::State;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Flipped once the workload controllers are running.
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub async fn readiness(State(readiness): State<Readiness>) -> impl IntoResponse {
    if readiness.is_ready() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub async fn liveness() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub fn create_app(readiness: Readiness) -> Router {
    Router::new()
        .route("/health/live", get(liveness))
        .route("/health/ready", get(self::readiness))
        .with_state(readiness)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn status_of(app: Router, uri: &str) -> StatusCode {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_liveness() {
        let app = create_app(Readiness::default());
        assert_eq!(status_of(app, "/health/live").await, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_readiness_follows_controller_start() {
        let readiness = Readiness::default();

        let app = create_app(readiness.clone());
        assert_eq!(
            status_of(app, "/health/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        readiness.mark_ready();
        let app = create_app(readiness);
        assert_eq!(status_of(app, "/health/ready").await, StatusCode::NO_CONTENT);
    }
}
