use crate::error::RudpError;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use tracing::debug;

/// Name resolution seam: turns a (host, service) pair into an ordered list of
///  endpoints to try. Connect attempts walk the list front to back.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn resolve(&self, host: &str, service: &str) -> Result<Vec<SocketAddr>, RudpError>;
}

/// Default resolver, backed by the runtime's `lookup_host`.
pub struct TokioResolver;

#[async_trait]
impl Resolver for TokioResolver {
    async fn resolve(&self, host: &str, service: &str) -> Result<Vec<SocketAddr>, RudpError> {
        let endpoints: Vec<SocketAddr> = tokio::net::lookup_host(format!("{}:{}", host, service))
            .await
            .map_err(|e| RudpError::NameResolution(e.to_string()))?
            .collect();
        debug!("resolved {}:{} to {:?}", host, service, endpoints);
        Ok(endpoints)
    }
}
