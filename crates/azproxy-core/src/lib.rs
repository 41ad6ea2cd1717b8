pub mod bootstrap;
pub mod converter;
pub mod core;
pub mod deployment;
pub mod director;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod headers;
pub mod route;
pub mod upstream_client;

pub use bootstrap::{Bootstrap, CliArgs, bootstrap, bootstrap_from_env, load_config};
pub use converter::{ConvertError, ConvertParams, Converter, PathTemplate, PrefixStrip, TemplateConverter};
pub use crate::core::{Core, CoreState};
pub use deployment::{DeploymentMapping, DeploymentResolver};
pub use director::{AzureTarget, Director, DirectorError, InboundRequest, OutboundRequest};
pub use dispatch::{Dispatcher, FailureKind, RequestPhase, RequestTrace};
pub use error::ProxyError;
pub use route::{MethodFilter, ModelSource, Route, RouteError, RouteTable, openai_routes};
pub use upstream_client::{
    UpstreamClient, UpstreamClientConfig, UpstreamFailure, UpstreamResponse,
    UpstreamTransportErrorKind, WreqUpstreamClient,
};
