//! HTTP surface for a guarded server: the Prometheus `/metrics` endpoint and a mapping from
//! [`Status`] to HTTP responses.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::http::HeaderValue;
use axum::http::StatusCode;
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use tracing::info;
use tracing::warn;

use crate::error::GuardError;
use crate::metrics::MetricsRegistry;
use crate::status::Code;
use crate::status::Status;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

async fn render_metrics(State(registry): State<MetricsRegistry>) -> Response {
    match registry.render() {
        Ok(text) => ([(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], text).into_response(),
        Err(err) => {
            warn!(%err, "failed to collect metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

/// A router answering `GET /metrics` from `registry`.
pub fn metrics_router(registry: MetricsRegistry) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(registry)
}

/// Serves [`metrics_router`] on `addr` until the listener fails.
pub async fn serve_metrics(registry: MetricsRegistry, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "serving metrics");
    axum::serve(listener, metrics_router(registry)).await
}

fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::Cancelled => StatusCode::REQUEST_TIMEOUT,
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
            StatusCode::BAD_REQUEST
        }
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::Unknown | Code::Internal | Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for Status {
    fn into_response(self) -> Response {
        let retry_after = match self.cause() {
            Some(GuardError::RateLimited { retry_after }) => {
                Some(HeaderValue::from(retry_after.as_secs().max(1)))
            }
            _ => None,
        };

        let mut response = (http_status(self.code()), self.to_string()).into_response();
        if let Some(value) = retry_after {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tower::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn metrics_endpoint_renders_registry() {
        let registry = MetricsRegistry::new();
        registry.meter().u64_counter("hits_total").build().add(1, &[]);

        let response = metrics_router(registry)
            .oneshot(
                axum::http::Request::get("/metrics")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            EXPOSITION_CONTENT_TYPE
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&body).contains("hits_total 1"));
    }

    #[test]
    fn rate_limited_status_sets_retry_after() {
        let status = Status::from(GuardError::RateLimited {
            retry_after: Duration::from_millis(300),
        });
        let response = status.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }
}
