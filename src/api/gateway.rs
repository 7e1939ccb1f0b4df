/// Request interception
///
/// The gateway answers requests whose path falls under [`API_PREFIX`] and
/// leaves every other request to whatever the host would have done with it.

use super::routes::{create_record_routes, ApiState, API_PREFIX};
use crate::service::WorkflowService;
use axum::{
    body::Body,
    http::Request,
    response::Response,
    Router,
};
use std::sync::Arc;
use tower::ServiceExt;

/// Whether a request path belongs to the emulated backend
pub fn intercepts(path: &str) -> bool {
    path == API_PREFIX
        || path
            .strip_prefix(API_PREFIX)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[derive(Clone)]
pub struct Gateway {
    router: Router,
}

impl Gateway {
    pub fn new(service: Arc<WorkflowService>) -> Self {
        let router = Router::new()
            .nest(API_PREFIX, create_record_routes())
            .with_state(ApiState { service });
        Self { router }
    }

    /// Router serving only the emulated backend API
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Answer a request if it targets the emulated backend
    ///
    /// Returns `None` for paths outside the prefix so the caller can pass the
    /// request through unchanged.
    pub async fn handle_request(&self, request: Request<Body>) -> Option<Response> {
        if !intercepts(request.uri().path()) {
            return None;
        }

        tracing::debug!("Intercepted {} {}", request.method(), request.uri().path());
        match self.router.clone().oneshot(request).await {
            Ok(response) => Some(response),
            Err(never) => match never {},
        }
    }

    /// Put the gateway in front of `inner`; unprefixed requests reach `inner`
    pub fn intercept(&self, inner: Router) -> Router {
        self.router.clone().fallback_service(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_match_is_segment_aligned() {
        assert!(intercepts("/api/workflows"));
        assert!(intercepts("/api/workflows/runs"));
        assert!(intercepts("/api/workflows/queue/__wkf_workflow_x"));
        assert!(!intercepts("/api/workflowsx"));
        assert!(!intercepts("/api/workflow/ws"));
        assert!(!intercepts("/healthz"));
    }
}
