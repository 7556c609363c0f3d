use std::future::Future;
use std::net::TcpListener;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use vigil_core::{Endpoint, RegistryError, ServiceBinding, VigilError};
use vigil_registry::Registry;

#[derive(Clone)]
pub struct HttpState {
    pub registry: Arc<Registry>,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(OpenApi)]
#[openapi(
    paths(list_services, resolve_service, health_check),
    components(schemas(ServiceBinding, Endpoint, ErrorBody))
)]
struct ApiDoc;

#[derive(Serialize, ToSchema)]
struct ErrorBody {
    #[schema(example = "service ghost not found")]
    error: String,
}

fn error_response(status: StatusCode, err: &RegistryError) -> Response {
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .route("/api/registry", get(list_services))
        .route("/api/registry/:name", get(resolve_service))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the registry API on an already bound listener until `shutdown`
/// completes.
pub async fn serve(
    listener: TcpListener,
    state: HttpState,
    shutdown: impl Future<Output = ()>,
) -> Result<(), VigilError> {
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    let server = axum::Server::from_tcp(listener)
        .map_err(|e| VigilError::Unavailable(e.to_string()))?
        .serve(router(state).into_make_service())
        .with_graceful_shutdown(shutdown);
    info!(%addr, "registry http listening");
    server.await.map_err(|e| {
        warn!(error = %e, "registry http server failed");
        VigilError::Unavailable(e.to_string())
    })
}

#[utoipa::path(
    get,
    path = "/api/registry",
    responses((status = 200, description = "All bound services", body = Vec<ServiceBinding>))
)]
async fn list_services(State(state): State<HttpState>) -> Response {
    match state.registry.list() {
        Ok(bindings) => (StatusCode::OK, Json(bindings)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

#[utoipa::path(
    get,
    path = "/api/registry/{name}",
    responses(
        (status = 200, description = "Service endpoint", body = ServiceBinding),
        (status = 404, description = "Name not bound", body = ErrorBody)
    ),
    params(("name" = String, Path, description = "Service name"))
)]
async fn resolve_service(State(state): State<HttpState>, Path(name): Path<String>) -> Response {
    match state.registry.lookup(&name) {
        Ok(binding) => (StatusCode::OK, Json(binding)).into_response(),
        Err(e @ RegistryError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, &e),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "OK"))
)]
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn render_metrics(State(state): State<HttpState>) -> String {
    state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_registry::PortRange;

    fn state() -> HttpState {
        let scout = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let base = scout.local_addr().unwrap().port().min(65_000);
        drop(scout);
        let range = PortRange::new(base, base + 20).unwrap();
        HttpState {
            registry: Arc::new(Registry::in_memory("127.0.0.1", range).unwrap()),
            metrics: None,
        }
    }

    #[tokio::test]
    async fn resolve_unknown_name_is_404() {
        let response = resolve_service(State(state()), Path("ghost".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn resolve_and_list_bound_names() {
        let state = state();
        let _binding = state.registry.bind("vigil").unwrap();

        let response = resolve_service(State(state.clone()), Path("vigil".to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = list_services(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn openapi_documents_registry_paths() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/api/registry/{name}"));
        assert!(doc.paths.paths.contains_key("/api/registry"));
    }
}
