use std::future::Future;

use reqwest::{Client, StatusCode, Url};
use tracing::debug;
use vigil_core::{Endpoint, RegistryError, Resolver, ServiceBinding};

/// Resolves service names through the registry's HTTP surface.
#[derive(Clone)]
pub struct HttpResolver {
    client: Client,
    base_url: String,
}

impl HttpResolver {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `base_url` extended by `segments`, each percent-encoded as one path
    /// segment.
    fn url(&self, segments: &[&str]) -> Result<Url, RegistryError> {
        let invalid = |reason: String| RegistryError::Unreachable(format!("{}: {reason}", self.base_url));
        let mut url = Url::parse(&self.base_url).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| invalid("not a base URL".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub async fn lookup(&self, name: &str) -> Result<ServiceBinding, RegistryError> {
        let url = self.url(&["api", "registry", name])?;
        debug!(%url, "resolving service");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| RegistryError::Unreachable(e.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(name.to_string())),
            status if !status.is_success() => Err(RegistryError::Unreachable(format!(
                "{url} answered {status}"
            ))),
            _ => response
                .json::<ServiceBinding>()
                .await
                .map_err(|e| RegistryError::Unreachable(e.to_string())),
        }
    }

    pub async fn list(&self) -> Result<Vec<ServiceBinding>, RegistryError> {
        let url = self.url(&["api", "registry"])?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RegistryError::Unreachable(e.to_string()))?
            .error_for_status()
            .map_err(|e| RegistryError::Unreachable(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| RegistryError::Unreachable(e.to_string()))
    }

    /// `true` if the registry answers its health check.
    pub async fn health(&self) -> bool {
        let Ok(url) = self.url(&["health"]) else {
            return false;
        };
        matches!(self.client.get(url).send().await, Ok(r) if r.status().is_success())
    }
}

impl Resolver for HttpResolver {
    fn resolve(&self, name: &str) -> impl Future<Output = Result<Endpoint, RegistryError>> + Send {
        async move { self.lookup(name).await.map(|binding| binding.endpoint()) }
    }
}
