use std::sync::Arc;

use azproxy_common::GlobalConfig;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, HOST, HeaderValue};
use http::{HeaderMap, Method, Uri};
use serde::Deserialize;

use crate::converter::{ConvertError, ConvertParams, DEPLOYMENT_NAME};
use crate::deployment::DeploymentResolver;
use crate::headers::{API_KEY_HEADER, bearer_token, caller_api_key, strip_hop_by_hop};
use crate::route::{ModelSource, RouteMatch};

pub const API_VERSION_PARAM: &str = "api-version";

/// Azure OpenAI resource the proxy forwards to.
#[derive(Clone)]
pub struct AzureTarget {
    endpoint: String,
    api_key: Option<String>,
    api_version: String,
}

impl AzureTarget {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        api_version: impl Into<String>,
    ) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Self {
            endpoint,
            api_key,
            api_version: api_version.into(),
        }
    }

    pub fn from_config(config: &GlobalConfig) -> Self {
        Self::new(
            config.endpoint.clone(),
            config.api_key.clone(),
            config.api_version.clone(),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    pub fn has_fallback_key(&self) -> bool {
        self.api_key.is_some()
    }
}

impl std::fmt::Debug for AzureTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureTarget")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_version", &self.api_version)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    /// Path and query of the outbound url, for logs and tests.
    pub fn path_and_query(&self) -> &str {
        let after_scheme = self
            .url
            .split_once("://")
            .map_or(self.url.as_str(), |(_, rest)| rest);
        after_scheme
            .find('/')
            .map_or("/", |index| &after_scheme[index..])
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DirectorError {
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error("no api key supplied and no fallback key configured")]
    MissingCredential,
    #[error("api key is not a valid header value")]
    InvalidCredential,
    #[error("query string could not be encoded: {0}")]
    Query(#[from] serde_urlencoded::ser::Error),
}

#[derive(Deserialize)]
struct BodyModel {
    model: Option<String>,
}

/// Builds the Azure-bound request for one matched inbound request.
#[derive(Debug, Clone)]
pub struct Director {
    target: Arc<AzureTarget>,
    resolver: Arc<DeploymentResolver>,
}

impl Director {
    pub fn new(target: Arc<AzureTarget>, resolver: Arc<DeploymentResolver>) -> Self {
        Self { target, resolver }
    }

    pub fn target(&self) -> &AzureTarget {
        &self.target
    }

    pub fn build_outbound(
        &self,
        inbound: &InboundRequest,
        matched: &RouteMatch<'_>,
    ) -> Result<OutboundRequest, DirectorError> {
        let route = matched.route;
        let mut params = ConvertParams::new();
        for (name, value) in &matched.params {
            params.insert(name.clone(), value.clone());
        }
        if let Some(model) = requested_model(route.model_source(), matched, &inbound.body)? {
            let deployment = self.resolver.resolve(&model)?;
            params.insert(DEPLOYMENT_NAME, deployment);
        }

        let path = route.converter().convert(inbound.uri.path(), &params)?;
        let query = outbound_query(inbound.uri.query(), &self.target.api_version)?;
        let url = format!("{}{path}?{query}", self.target.endpoint);

        let api_key = self.api_key(&inbound.headers)?;
        let mut headers = inbound.headers.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);
        headers.remove(AUTHORIZATION);
        // `insert` drops every previous value, so the key is sent once.
        headers.insert(API_KEY_HEADER, api_key);

        Ok(OutboundRequest {
            method: inbound.method.clone(),
            url,
            headers,
            body: inbound.body.clone(),
        })
    }

    /// Caller bearer token, then caller `api-key`, then the configured key.
    fn api_key(&self, headers: &HeaderMap) -> Result<HeaderValue, DirectorError> {
        let mut value = if let Some(token) = bearer_token(headers) {
            HeaderValue::from_str(token).map_err(|_| DirectorError::InvalidCredential)?
        } else if let Some(value) = caller_api_key(headers) {
            value.clone()
        } else if let Some(key) = self.target.api_key.as_deref() {
            HeaderValue::from_str(key).map_err(|_| DirectorError::InvalidCredential)?
        } else {
            return Err(DirectorError::MissingCredential);
        };
        value.set_sensitive(true);
        Ok(value)
    }
}

fn requested_model(
    source: &ModelSource,
    matched: &RouteMatch<'_>,
    body: &Bytes,
) -> Result<Option<String>, ConvertError> {
    match source {
        ModelSource::None => Ok(None),
        ModelSource::PathParam(name) => matched
            .param(name)
            .map(|model| Some(decode_path_segment(model)))
            .ok_or_else(|| ConvertError::UnresolvedPlaceholder(name.clone())),
        ModelSource::BodyField => serde_json::from_slice::<BodyModel>(body)
            .ok()
            .and_then(|parsed| parsed.model)
            .filter(|model| !model.is_empty())
            .map(Some)
            .ok_or_else(|| ConvertError::UnresolvedPlaceholder(DEPLOYMENT_NAME.to_string())),
    }
}

/// Path segments arrive percent-encoded; mapping keys are plain model names.
fn decode_path_segment(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

/// Inbound query kept verbatim, with `api-version` present exactly once.
///
/// Segments are compared by decoded name but re-joined as sent, so the
/// caller's own encoding survives.
fn outbound_query(query: Option<&str>, api_version: &str) -> Result<String, DirectorError> {
    let raw = query.unwrap_or_default();
    let mut segments: Vec<String> = Vec::new();
    let mut has_version = false;
    if !raw.is_empty() {
        for segment in raw.split('&') {
            if query_segment_name(segment).as_deref() == Some(API_VERSION_PARAM) {
                if has_version {
                    continue;
                }
                has_version = true;
            }
            segments.push(segment.to_string());
        }
    }
    if !has_version {
        segments.push(serde_urlencoded::to_string([(API_VERSION_PARAM, api_version)])?);
    }
    Ok(segments.join("&"))
}

fn query_segment_name(segment: &str) -> Option<String> {
    let name = segment.split('=').next().unwrap_or_default();
    serde_urlencoded::from_str::<Vec<(String, String)>>(name)
        .ok()?
        .into_iter()
        .next()
        .map(|(name, _)| name)
}

#[cfg(test)]
mod tests {
    use http::header::CONTENT_TYPE;

    use super::*;
    use crate::deployment::DeploymentMapping;
    use crate::route::openai_routes;

    const ENDPOINT: &str = "https://res.openai.azure.com";

    fn director(fallback: Option<&str>) -> Director {
        Director::new(
            Arc::new(AzureTarget::new(
                format!("{ENDPOINT}/"),
                fallback.map(str::to_string),
                "2024-02-01",
            )),
            Arc::new(DeploymentResolver::new(DeploymentMapping::from_iter([
                ("gpt-3.5-turbo", "gpt-35-turbo"),
                ("text-embedding-ada-002", "ada"),
            ]))),
        )
    }

    fn inbound(method: Method, uri: &str, headers: &[(&str, &str)], body: &str) -> InboundRequest {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        InboundRequest {
            method,
            uri: uri.parse().unwrap(),
            headers: map,
            body: Bytes::from(body.to_string()),
        }
    }

    fn build(director: &Director, req: &InboundRequest) -> Result<OutboundRequest, DirectorError> {
        let table = openai_routes("/v1").unwrap();
        let matched = table.match_request(&req.method, req.uri.path()).unwrap();
        director.build_outbound(req, &matched)
    }

    #[test]
    fn models_list_is_prefix_stripped() {
        let req = inbound(Method::GET, "/v1/models", &[("authorization", "Bearer sk-1")], "");
        let out = build(&director(None), &req).unwrap();
        assert_eq!(out.url, format!("{ENDPOINT}/openai/models?api-version=2024-02-01"));
        assert_eq!(out.path_and_query(), "/openai/models?api-version=2024-02-01");
        assert_eq!(out.method, Method::GET);
    }

    #[test]
    fn chat_completions_resolves_body_model() {
        let body = r#"{"model":"gpt-3.5-turbo","stream":true,"messages":[]}"#;
        let req = inbound(
            Method::POST,
            "/v1/chat/completions",
            &[
                ("authorization", "Bearer sk-caller"),
                ("content-type", "application/json"),
                ("content-length", "58"),
                ("host", "localhost:8080"),
            ],
            body,
        );
        let out = build(&director(Some("fallback")), &req).unwrap();

        assert_eq!(
            out.path_and_query(),
            "/openai/deployments/gpt-35-turbo/chat/completions?api-version=2024-02-01"
        );
        assert_eq!(out.method, Method::POST);
        assert_eq!(out.body, Bytes::from(body));
        assert_eq!(out.headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(out.headers.get(API_KEY_HEADER).unwrap(), "sk-caller");
        assert!(out.headers.get(AUTHORIZATION).is_none());
        assert!(out.headers.get(HOST).is_none());
        assert!(out.headers.get(CONTENT_LENGTH).is_none());
    }

    #[test]
    fn engines_route_resolves_path_model() {
        let req = inbound(
            Method::POST,
            "/v1/engines/text-embedding-ada-002/embeddings",
            &[("api-key", "k")],
            r#"{"input":"hi"}"#,
        );
        let out = build(&director(None), &req).unwrap();
        assert_eq!(
            out.path_and_query(),
            "/openai/deployments/ada/embeddings?api-version=2024-02-01"
        );
    }

    #[test]
    fn unknown_model_fails_before_any_path_is_built() {
        let req = inbound(
            Method::POST,
            "/v1/engines/gpt-4/embeddings",
            &[("authorization", "Bearer sk")],
            "{}",
        );
        let err = build(&director(None), &req).unwrap_err();
        assert!(matches!(
            err,
            DirectorError::Convert(ConvertError::UnknownModel(model)) if model == "gpt-4"
        ));
    }

    #[test]
    fn body_without_model_is_unresolved() {
        for body in ["", "not json", r#"{"messages":[]}"#, r#"{"model":7}"#, r#"{"model":""}"#] {
            let req = inbound(
                Method::POST,
                "/v1/completions",
                &[("authorization", "Bearer sk")],
                body,
            );
            let err = build(&director(None), &req).unwrap_err();
            assert!(
                matches!(
                    &err,
                    DirectorError::Convert(ConvertError::UnresolvedPlaceholder(field))
                        if field == DEPLOYMENT_NAME
                ),
                "body {body:?}: {err}"
            );
        }
    }

    #[test]
    fn credential_precedence() {
        let director = director(Some("fallback"));

        let req = inbound(
            Method::GET,
            "/v1/models",
            &[("authorization", "Bearer tok"), ("api-key", "header")],
            "",
        );
        let out = build(&director, &req).unwrap();
        assert_eq!(out.headers.get_all(API_KEY_HEADER).iter().count(), 1);
        assert_eq!(out.headers.get(API_KEY_HEADER).unwrap(), "tok");

        let req = inbound(Method::GET, "/v1/models", &[("api-key", "header")], "");
        assert_eq!(
            build(&director, &req).unwrap().headers.get(API_KEY_HEADER).unwrap(),
            "header"
        );

        let req = inbound(Method::GET, "/v1/models", &[("authorization", "Basic abc")], "");
        let out = build(&director, &req).unwrap();
        assert_eq!(out.headers.get(API_KEY_HEADER).unwrap(), "fallback");
        assert!(out.headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn missing_credential_without_fallback() {
        let req = inbound(Method::GET, "/v1/models", &[], "");
        assert!(matches!(
            build(&director(None), &req),
            Err(DirectorError::MissingCredential)
        ));
    }

    #[test]
    fn api_version_is_never_duplicated() {
        let director = director(Some("k"));

        let req = inbound(Method::GET, "/v1/models?limit=5&after=a%20b", &[], "");
        assert_eq!(
            build(&director, &req).unwrap().path_and_query(),
            "/openai/models?limit=5&after=a%20b&api-version=2024-02-01"
        );

        let req = inbound(Method::GET, "/v1/models?api-version=2023-05-15", &[], "");
        assert_eq!(
            build(&director, &req).unwrap().path_and_query(),
            "/openai/models?api-version=2023-05-15"
        );

        let req = inbound(
            Method::GET,
            "/v1/models?api-version=2023-05-15&x=1&api-version=2022-12-01",
            &[],
            "",
        );
        assert_eq!(
            build(&director, &req).unwrap().path_and_query(),
            "/openai/models?api-version=2023-05-15&x=1"
        );
    }

    #[test]
    fn duplicate_api_version_keeps_other_parameters_as_sent() {
        let req = inbound(
            Method::GET,
            "/v1/models?after=a%20b&api-version=2023-05-15&flag&api%2Dversion=2022-12-01&q=x+y",
            &[],
            "",
        );
        assert_eq!(
            build(&director(Some("k")), &req).unwrap().path_and_query(),
            "/openai/models?after=a%20b&api-version=2023-05-15&flag&q=x+y"
        );
    }

    #[test]
    fn path_model_is_percent_decoded_before_lookup() {
        let director = Director::new(
            Arc::new(AzureTarget::new(ENDPOINT, Some("k".to_string()), "2024-02-01")),
            Arc::new(DeploymentResolver::new(DeploymentMapping::from_iter([(
                "my model",
                "my-deployment",
            )]))),
        );
        let req = inbound(Method::POST, "/v1/engines/my%20model/embeddings", &[], "{}");
        assert_eq!(
            build(&director, &req).unwrap().path_and_query(),
            "/openai/deployments/my-deployment/embeddings?api-version=2024-02-01"
        );
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let req = inbound(
            Method::GET,
            "/v1/models",
            &[
                ("connection", "keep-alive, x-trace-hop"),
                ("x-trace-hop", "1"),
                ("x-request-id", "abc"),
                ("api-key", "k"),
            ],
            "",
        );
        let out = build(&director(None), &req).unwrap();
        assert!(out.headers.get("x-trace-hop").is_none());
        assert!(out.headers.get("connection").is_none());
        assert_eq!(out.headers.get("x-request-id").unwrap(), "abc");
    }

    #[test]
    fn target_debug_redacts_key() {
        let target = AzureTarget::new(ENDPOINT, Some("secret".to_string()), "v");
        let rendered = format!("{target:?}");
        assert!(!rendered.contains("secret"));
        assert!(target.has_fallback_key());
    }
}
