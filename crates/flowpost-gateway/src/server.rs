//! HTTP server implementation using Axum.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    response::IntoResponse,
    routing::{get, post},
};
use flowpost_core::config::GatewayConfig;
use flowpost_scheduler::FlowEngine;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    /// Flow engine: run store, collaborators, batch limits.
    pub engine: Arc<FlowEngine>,
    pub gateway_config: GatewayConfig,
    pub start_time: std::time::Instant,
}

/// Auth middleware: resolves the caller from the cron secret or an owner
/// token and hands it to handlers as an `Extension<Caller>`.
async fn require_caller(
    State(state): State<Arc<AppState>>,
    mut req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let caller = auth::authenticate(
        state.gateway_config.secret(),
        state.engine.db(),
        req.headers(),
        req.uri().query(),
    );

    match caller {
        Ok(Some(caller)) => {
            tracing::debug!("{} {} as {}", req.method(), req.uri().path(), caller.label());
            req.extensions_mut().insert(caller);
            next.run(req).await
        }
        Ok(None) => (
            axum::http::StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "ok": false,
                "code": "UNAUTHORIZED",
                "error": "Unauthorized: missing or invalid cron key / owner token"
            })),
        )
            .into_response(),
        Err(e) => crate::routes::error_reply(&e).into_response(),
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    use crate::routes;

    // Protected routes: cron secret or owner token
    let protected = Router::new()
        .route("/api/v1/info", get(routes::system_info))
        .route("/api/v1/automation/tick", post(routes::tick))
        .route("/api/v1/automation/tick-all", post(routes::tick_all))
        .route("/api/v1/automation/enroll", post(routes::enroll))
        .route("/api/v1/automation/worker", post(routes::worker))
        .route("/api/v1/automation/requeue", post(routes::requeue))
        .route(
            "/api/v1/automation/flows/{id}/kick",
            post(routes::kick_flow),
        )
        .route(
            "/api/v1/automation/flows/{id}/reset",
            post(routes::reset_flow),
        )
        .route(
            "/api/v1/automation/flows/{id}/stats",
            get(routes::flow_stats),
        )
        .route(
            "/api/v1/automation/flows/{id}/diagnose",
            get(routes::flow_diagnose),
        )
        .route("/api/v1/automation/flows/{id}/runs", get(routes::flow_runs))
        .route(
            "/api/v1/automation/runs/{id}/cancel",
            post(routes::cancel_run),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_caller,
        ));

    let public = Router::new().route("/health", get(routes::health_check));

    protected
        .merge(public)
        .layer({
            let cors = CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .max_age(std::time::Duration::from_secs(3600));

            // Example: FLOWPOST_CORS_ORIGINS=https://app.example.com,https://admin.example.com
            if let Ok(origins_str) = std::env::var("FLOWPOST_CORS_ORIGINS") {
                let origins: Vec<_> = origins_str
                    .split(',')
                    .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
                    .collect();
                cors.allow_origin(origins)
            } else {
                cors.allow_origin(Any)
            }
        })
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server.
pub async fn start(config: &GatewayConfig, engine: Arc<FlowEngine>) -> anyhow::Result<()> {
    if config.secret().is_none() {
        tracing::warn!("⚠️ No cron secret configured: secret-only endpoints will reject every call");
    }

    let state = AppState {
        engine,
        gateway_config: config.clone(),
        start_time: std::time::Instant::now(),
    };
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use flowpost_channels::LogGateway;
    use flowpost_scheduler::SchedulerDb;
    use tower::ServiceExt;

    fn app(secret: Option<&str>) -> (Router, Arc<SchedulerDb>) {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let engine = Arc::new(FlowEngine::new(db.clone(), Arc::new(LogGateway::new())));
        let router = build_router(AppState {
            engine,
            gateway_config: GatewayConfig {
                cron_secret: secret.map(String::from),
                ..Default::default()
            },
            start_time: std::time::Instant::now(),
        });
        (router, db)
    }

    fn post_json(uri: &str, header: Option<(&str, &str)>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some((k, v)) = header {
            builder = builder.header(k, v);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let (router, _) = app(None);
        let resp = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_credentials_get_401() {
        let (router, _) = app(Some("s3cret"));
        let resp = router
            .oneshot(post_json("/api/v1/automation/tick-all", None, "{}"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_secret_header_passes() {
        let (router, _) = app(Some("s3cret"));
        let resp = router
            .oneshot(post_json(
                "/api/v1/automation/tick-all",
                Some(("x-cron-key", "s3cret")),
                "{}",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_no_secret_configured_means_no_bypass() {
        let (router, _) = app(None);
        let resp = router
            .oneshot(post_json(
                "/api/v1/automation/tick-all?key=anything",
                Some(("x-cron-key", "anything")),
                "{}",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_owner_token_cannot_use_secret_routes() {
        let (router, db) = app(Some("s3cret"));
        let token = db.issue_owner_token("u1", "test", chrono::Utc::now()).unwrap();
        let bearer = format!("Bearer {token}");
        let resp = router
            .oneshot(post_json(
                "/api/v1/automation/tick-all",
                Some(("authorization", &bearer)),
                "{}",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
