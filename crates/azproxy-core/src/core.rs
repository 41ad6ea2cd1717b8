use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use azproxy_common::GlobalConfig;
use tracing::info;

use crate::deployment::{DeploymentMapping, DeploymentResolver};
use crate::director::{AzureTarget, Director};
use crate::dispatch::Dispatcher;
use crate::handler::proxy_handler;
use crate::route::{RouteConfigError, RouteTable, openai_routes};
use crate::upstream_client::UpstreamClient;

pub struct CoreState {
    pub routes: RouteTable,
    pub director: Director,
    pub dispatcher: Dispatcher,
}

pub struct Core {
    state: Arc<CoreState>,
    max_body_bytes: usize,
}

impl Core {
    pub fn new(
        routes: RouteTable,
        target: AzureTarget,
        resolver: Arc<DeploymentResolver>,
        client: Arc<dyn UpstreamClient>,
        max_body_bytes: usize,
    ) -> Self {
        let director = Director::new(Arc::new(target), resolver);
        Self {
            state: Arc::new(CoreState {
                routes,
                director,
                dispatcher: Dispatcher::new(client),
            }),
            max_body_bytes,
        }
    }

    pub fn from_config(
        config: &GlobalConfig,
        client: Arc<dyn UpstreamClient>,
    ) -> Result<Self, RouteConfigError> {
        let routes = openai_routes(&config.api_base)?;
        let resolver = Arc::new(DeploymentResolver::new(DeploymentMapping::from(
            &config.model_mapping,
        )));
        Ok(Self::new(
            routes,
            AzureTarget::from_config(config),
            resolver,
            client,
            config.max_body_bytes,
        ))
    }

    /// Every path not claimed by an outer router lands on the proxy handler,
    /// which does its own ordered matching.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .with_state(self.state.clone())
            .layer(DefaultBodyLimit::max(self.max_body_bytes))
    }

    pub fn state(&self) -> Arc<CoreState> {
        self.state.clone()
    }

    pub fn log_routes(&self) {
        let target = self.state.director.target();
        info!(
            endpoint = %target.endpoint(),
            api_version = %target.api_version(),
            fallback_key = target.has_fallback_key(),
            "azure target"
        );
        for route in self.state.routes.routes() {
            info!(
                route = %route.name(),
                methods = ?route.methods(),
                pattern = %route.pattern().as_str(),
                converter = route.converter().kind(),
                target = %route.converter().target_path(),
                "route registered"
            );
        }
    }
}
