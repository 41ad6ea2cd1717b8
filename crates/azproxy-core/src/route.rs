use http::Method;

use crate::converter::{Converter, DEPLOYMENT_NAME, TemplateError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodFilter {
    Any,
    Only(Vec<Method>),
}

impl MethodFilter {
    pub fn allows(&self, method: &Method) -> bool {
        match self {
            MethodFilter::Any => true,
            MethodFilter::Only(methods) => methods.contains(method),
        }
    }
}

/// Where a route finds the client model name to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    None,
    /// A `{name}` segment of the route pattern.
    PathParam(String),
    /// The top-level `model` field of a JSON request body.
    BodyField,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternSegment {
    Literal(String),
    Param(String),
}

/// `/`-separated pattern where `{name}` matches exactly one non-empty segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    source: String,
    segments: Vec<PatternSegment>,
}

impl RoutePattern {
    pub fn parse(source: &str) -> Self {
        let segments = source
            .split('/')
            .map(|segment| match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(name) => PatternSegment::Param(name.to_string()),
                None => PatternSegment::Literal(segment.to_string()),
            })
            .collect();
        Self {
            source: source.to_string(),
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.segments
            .iter()
            .any(|segment| matches!(segment, PatternSegment::Param(param) if param == name))
    }

    /// Bound parameters when `path` matches, in pattern order.
    pub fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let mut params = Vec::new();
        let mut parts = path.split('/');
        for segment in &self.segments {
            let part = parts.next()?;
            match segment {
                PatternSegment::Literal(literal) if literal == part => {}
                PatternSegment::Literal(_) => return None,
                PatternSegment::Param(_) if part.is_empty() => return None,
                PatternSegment::Param(name) => params.push((name.clone(), part.to_string())),
            }
        }
        if parts.next().is_some() {
            return None;
        }
        Some(params)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("no route for {0}")]
    NotFound(String),
    #[error("method {method} not allowed for {path}")]
    MethodNotAllowed { method: Method, path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteConfigError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("route {route}: converter needs {{{field}}} which the route never provides")]
    UnprovidedField { route: String, field: String },
    #[error("route {route}: model parameter {{{param}}} is not in the pattern")]
    MissingModelParam { route: String, param: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    name: String,
    methods: MethodFilter,
    pattern: RoutePattern,
    converter: Converter,
    model_source: ModelSource,
}

impl Route {
    /// Builds a route, checking that every converter field can be supplied by
    /// either a pattern parameter or the resolved deployment.
    pub fn new(
        name: impl Into<String>,
        methods: MethodFilter,
        pattern: &str,
        converter: Converter,
        model_source: ModelSource,
    ) -> Result<Self, RouteConfigError> {
        let name = name.into();
        let pattern = RoutePattern::parse(pattern);
        if let ModelSource::PathParam(param) = &model_source {
            if !pattern.has_param(param) {
                return Err(RouteConfigError::MissingModelParam {
                    route: name,
                    param: param.clone(),
                });
            }
        }
        for field in converter.placeholders() {
            let provided = pattern.has_param(field)
                || (field == DEPLOYMENT_NAME && model_source != ModelSource::None);
            if !provided {
                return Err(RouteConfigError::UnprovidedField {
                    route: name,
                    field: field.to_string(),
                });
            }
        }
        Ok(Self {
            name,
            methods,
            pattern,
            converter,
            model_source,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &MethodFilter {
        &self.methods
    }

    pub fn pattern(&self) -> &RoutePattern {
        &self.pattern
    }

    pub fn converter(&self) -> &Converter {
        &self.converter
    }

    pub fn model_source(&self) -> &ModelSource {
        &self.model_source
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch<'a> {
    pub route: &'a Route,
    pub params: Vec<(String, String)>,
}

impl RouteMatch<'_> {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Ordered routes; the first route whose pattern and method both match wins.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, route: Route) -> &mut Self {
        self.routes.push(route);
        self
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn match_request(&self, method: &Method, path: &str) -> Result<RouteMatch<'_>, RouteError> {
        let mut path_matched = false;
        for route in &self.routes {
            let Some(params) = route.pattern.matches(path) else {
                continue;
            };
            if !route.methods.allows(method) {
                path_matched = true;
                continue;
            }
            return Ok(RouteMatch { route, params });
        }
        if path_matched {
            return Err(RouteError::MethodNotAllowed {
                method: method.clone(),
                path: path.to_string(),
            });
        }
        Err(RouteError::NotFound(path.to_string()))
    }
}

/// The OpenAI surface served under `api_base`, in registration order.
pub fn openai_routes(api_base: &str) -> Result<RouteTable, RouteConfigError> {
    let base = azproxy_common::normalize_api_base(api_base);
    let deployment_base = format!("/openai/deployments/{{{DEPLOYMENT_NAME}}}");
    let get_only = MethodFilter::Only(vec![Method::GET]);

    let mut table = RouteTable::new();
    table
        .register(Route::new(
            "models.list",
            get_only.clone(),
            &format!("{base}/models"),
            Converter::prefix_strip(&base, "/openai")?,
            ModelSource::None,
        )?)
        .register(Route::new(
            "models.get",
            get_only,
            &format!("{base}/models/{{model}}"),
            Converter::prefix_strip(&base, "/openai")?,
            ModelSource::None,
        )?)
        .register(Route::new(
            "engines.embeddings",
            MethodFilter::Any,
            &format!("{base}/engines/{{model}}/embeddings"),
            Converter::template(&format!("{deployment_base}/embeddings"))?,
            ModelSource::PathParam("model".to_string()),
        )?);
    for (name, path) in [
        ("completions", "/completions"),
        ("chat.completions", "/chat/completions"),
        ("embeddings", "/embeddings"),
    ] {
        table.register(Route::new(
            name,
            MethodFilter::Any,
            &format!("{base}{path}"),
            Converter::prefix_strip(&base, &deployment_base)?,
            ModelSource::BodyField,
        )?);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_binds_params() {
        let pattern = RoutePattern::parse("/v1/engines/{model}/embeddings");
        assert_eq!(
            pattern.matches("/v1/engines/ada/embeddings"),
            Some(vec![("model".to_string(), "ada".to_string())])
        );
        assert_eq!(pattern.matches("/v1/engines//embeddings"), None);
        assert_eq!(pattern.matches("/v1/engines/ada/embeddings/x"), None);
        assert_eq!(pattern.matches("/v1/engines/ada"), None);
        assert_eq!(pattern.matches("/v1/models/"), None);
    }

    #[test]
    fn openai_routes_resolve_expected_routes() {
        let table = openai_routes("/v1").unwrap();
        let cases = [
            (Method::GET, "/v1/models", "models.list"),
            (Method::GET, "/v1/models/gpt-4", "models.get"),
            (Method::POST, "/v1/engines/ada/embeddings", "engines.embeddings"),
            (Method::POST, "/v1/completions", "completions"),
            (Method::POST, "/v1/chat/completions", "chat.completions"),
            (Method::POST, "/v1/embeddings", "embeddings"),
        ];
        for (method, path, name) in cases {
            let matched = table.match_request(&method, path).unwrap();
            assert_eq!(matched.route.name(), name, "{method} {path}");
        }
        let matched = table
            .match_request(&Method::POST, "/v1/engines/ada/embeddings")
            .unwrap();
        assert_eq!(matched.param("model"), Some("ada"));
    }

    #[test]
    fn registered_routes_describe_their_azure_targets() {
        let table = openai_routes("/v1").unwrap();
        let described: Vec<(&str, &str, &str)> = table
            .routes()
            .iter()
            .map(|route| (route.name(), route.pattern().as_str(), route.converter().target_path()))
            .collect();
        assert_eq!(described[0], ("models.list", "/v1/models", "/openai"));
        assert_eq!(
            described[2],
            (
                "engines.embeddings",
                "/v1/engines/{model}/embeddings",
                "/openai/deployments/{DeploymentName}/embeddings"
            )
        );
        assert_eq!(
            described[4],
            (
                "chat.completions",
                "/v1/chat/completions",
                "/openai/deployments/{DeploymentName}"
            )
        );
        assert_eq!(table.routes()[0].methods(), &MethodFilter::Only(vec![Method::GET]));
        assert_eq!(table.routes()[5].methods(), &MethodFilter::Any);
    }

    #[test]
    fn unknown_path_and_wrong_method() {
        let table = openai_routes("/v1").unwrap();
        assert_eq!(
            table.match_request(&Method::GET, "/v1/images/generations"),
            Err(RouteError::NotFound("/v1/images/generations".to_string()))
        );
        assert!(matches!(
            table.match_request(&Method::POST, "/v1/models"),
            Err(RouteError::MethodNotAllowed { .. })
        ));
    }

    #[test]
    fn first_registered_route_wins() {
        let mut table = RouteTable::new();
        table
            .register(
                Route::new(
                    "specific",
                    MethodFilter::Any,
                    "/v1/models/{model}",
                    Converter::prefix_strip("/v1", "/first").unwrap(),
                    ModelSource::None,
                )
                .unwrap(),
            )
            .register(
                Route::new(
                    "shadowed",
                    MethodFilter::Any,
                    "/v1/models/{id}",
                    Converter::prefix_strip("/v1", "/second").unwrap(),
                    ModelSource::None,
                )
                .unwrap(),
            );
        let matched = table.match_request(&Method::GET, "/v1/models/x").unwrap();
        assert_eq!(matched.route.name(), "specific");
    }

    #[test]
    fn method_mismatch_falls_through_to_later_route() {
        let mut table = RouteTable::new();
        table
            .register(
                Route::new(
                    "get",
                    MethodFilter::Only(vec![Method::GET]),
                    "/v1/x",
                    Converter::prefix_strip("/v1", "/a").unwrap(),
                    ModelSource::None,
                )
                .unwrap(),
            )
            .register(
                Route::new(
                    "any",
                    MethodFilter::Any,
                    "/v1/x",
                    Converter::prefix_strip("/v1", "/b").unwrap(),
                    ModelSource::None,
                )
                .unwrap(),
            );
        let matched = table.match_request(&Method::DELETE, "/v1/x").unwrap();
        assert_eq!(matched.route.name(), "any");
    }

    #[test]
    fn registration_rejects_unprovided_fields() {
        let err = Route::new(
            "broken",
            MethodFilter::Any,
            "/v1/chat/completions",
            Converter::prefix_strip("/v1", "/openai/deployments/{DeploymentName}").unwrap(),
            ModelSource::None,
        )
        .unwrap_err();
        assert!(matches!(err, RouteConfigError::UnprovidedField { .. }));

        let err = Route::new(
            "broken",
            MethodFilter::Any,
            "/v1/engines/embeddings",
            Converter::template("/openai/deployments/{DeploymentName}/embeddings").unwrap(),
            ModelSource::PathParam("model".to_string()),
        )
        .unwrap_err();
        assert!(matches!(err, RouteConfigError::MissingModelParam { .. }));
    }

    #[test]
    fn routes_under_root_base() {
        let table = openai_routes("/").unwrap();
        let matched = table
            .match_request(&Method::POST, "/chat/completions")
            .unwrap();
        assert_eq!(matched.route.name(), "chat.completions");
    }
}
