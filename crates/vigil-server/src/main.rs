use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use vigil_core::{CredentialStore, PasswordFileAuthenticator, PolicyEngine};
use vigil_registry::Registry;
use vigil_server::demo::{self, StateHolder};
use vigil_server::{
    ConnectorServer, HttpState, ObjectRegistry, REGISTRY_SERVICE, ServerConfig, http,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder).ok();

    let config = ServerConfig::from_env()?;

    let credentials = CredentialStore::from_file(&config.password_file)?;
    info!(
        path = %config.password_file.display(),
        identities = credentials.len(),
        "credentials loaded"
    );
    let policy = PolicyEngine::from_file(&config.policy_file)?;
    info!(
        path = %config.policy_file.display(),
        grants = policy.grant_count(),
        "policy loaded; changes take effect on restart"
    );

    let registry = Arc::new(Registry::in_memory(config.host.clone(), config.port_range)?);
    let mut http_binding = registry.bind(REGISTRY_SERVICE)?;
    let http_listener = http_binding
        .take_listener()
        .ok_or("registry binding has no listener")?;

    let objects = Arc::new(ObjectRegistry::new(config.notification_queue));
    objects.register_factory(demo::KIND, StateHolder::factory());
    objects.register(demo::OBJECT_NAME, demo::KIND, Box::new(StateHolder::default()))?;

    let server = ConnectorServer::new(
        config.connector(),
        registry.clone(),
        Arc::new(PasswordFileAuthenticator::new(credentials)),
        Arc::new(policy),
        objects,
    );
    let endpoint = server.start().await?;
    info!(service = %config.service_name, %endpoint, "vigil ready");

    let state = HttpState {
        registry,
        metrics: Some(handle),
    };
    let served = http::serve(http_listener, state, shutdown_signal()).await;

    server.stop().await;
    drop(http_binding);
    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("signal received, starting graceful shutdown");
}
