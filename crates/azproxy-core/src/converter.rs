//! Inbound OpenAI path -> outbound Azure path.
//!
//! A [`Converter`] is chosen per route when the route table is built. Both
//! variants are pure functions of the inbound path and the [`ConvertParams`]
//! collected for the request.

use std::collections::HashMap;

use azproxy_common::normalize_api_base;

/// Field filled with the resolved Azure deployment name.
pub const DEPLOYMENT_NAME: &str = "DeploymentName";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConvertError {
    #[error("path {path:?} is not under {prefix:?}")]
    RouteMismatch { path: String, prefix: String },
    #[error("no value for path field {{{0}}}")]
    UnresolvedPlaceholder(String),
    #[error("no deployment configured for model {0:?}")]
    UnknownModel(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unclosed placeholder in path template {0:?}")]
    Unclosed(String),
    #[error("empty placeholder in path template {0:?}")]
    Empty(String),
}

/// Request-derived fields a converter may substitute into a path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvertParams {
    fields: HashMap<String, String>,
}

impl ConvertParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(String),
}

/// A path with `{Name}` placeholders, parsed once at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        while let Some(start) = rest.find('{') {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 1..];
            let Some(end) = after.find('}') else {
                return Err(TemplateError::Unclosed(source.to_string()));
            };
            let name = after[..end].trim();
            if name.contains('{') {
                return Err(TemplateError::Unclosed(source.to_string()));
            }
            if name.is_empty() {
                return Err(TemplateError::Empty(source.to_string()));
            }
            segments.push(Segment::Field(name.to_string()));
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Field(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Renders the template, or fails on the first missing field without
    /// producing a partial path.
    pub fn render(&self, params: &ConvertParams) -> Result<String, ConvertError> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(name) => {
                    let value = params
                        .get(name)
                        .ok_or_else(|| ConvertError::UnresolvedPlaceholder(name.clone()))?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

/// Replaces the OpenAI API base with an Azure base path, keeping the rest of
/// the inbound path as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixStrip {
    api_base_prefix: String,
    azure_base_path: PathTemplate,
}

impl PrefixStrip {
    pub fn new(api_base_prefix: &str, azure_base_path: &str) -> Result<Self, TemplateError> {
        let azure_base_path = azure_base_path.trim().trim_end_matches('/');
        Ok(Self {
            api_base_prefix: normalize_api_base(api_base_prefix),
            azure_base_path: PathTemplate::parse(azure_base_path)?,
        })
    }

    pub fn azure_base_path(&self) -> &str {
        self.azure_base_path.as_str()
    }

    /// Remainder of `path` after the prefix, matched on a segment boundary.
    fn remainder<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(self.api_base_prefix.as_str())?;
        (rest.is_empty() || rest.starts_with('/')).then_some(rest)
    }

    pub fn convert(&self, inbound_path: &str, params: &ConvertParams) -> Result<String, ConvertError> {
        let Some(rest) = self.remainder(inbound_path) else {
            return Err(ConvertError::RouteMismatch {
                path: inbound_path.to_string(),
                prefix: self.api_base_prefix.clone(),
            });
        };
        let mut out = self.azure_base_path.render(params)?;
        out.push_str(rest);
        Ok(out)
    }
}

/// Renders a fixed Azure path template; the inbound path is not consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateConverter {
    template: PathTemplate,
}

impl TemplateConverter {
    pub fn new(template: &str) -> Result<Self, TemplateError> {
        Ok(Self {
            template: PathTemplate::parse(template.trim())?,
        })
    }

    pub fn template(&self) -> &str {
        self.template.as_str()
    }

    pub fn convert(&self, params: &ConvertParams) -> Result<String, ConvertError> {
        self.template.render(params)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Converter {
    PrefixStrip(PrefixStrip),
    Template(TemplateConverter),
}

impl Converter {
    pub fn prefix_strip(api_base_prefix: &str, azure_base_path: &str) -> Result<Self, TemplateError> {
        PrefixStrip::new(api_base_prefix, azure_base_path).map(Converter::PrefixStrip)
    }

    pub fn template(template: &str) -> Result<Self, TemplateError> {
        TemplateConverter::new(template).map(Converter::Template)
    }

    pub fn convert(&self, inbound_path: &str, params: &ConvertParams) -> Result<String, ConvertError> {
        match self {
            Converter::PrefixStrip(strip) => strip.convert(inbound_path, params),
            Converter::Template(template) => template.convert(params),
        }
    }

    /// Every field name the converter will ask for.
    pub fn placeholders(&self) -> Vec<&str> {
        match self {
            Converter::PrefixStrip(strip) => strip.azure_base_path.placeholders().collect(),
            Converter::Template(template) => template.template.placeholders().collect(),
        }
    }

    /// Azure-side path or template this converter renders into.
    pub fn target_path(&self) -> &str {
        match self {
            Converter::PrefixStrip(strip) => strip.azure_base_path(),
            Converter::Template(template) => template.template(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Converter::PrefixStrip(_) => "prefix_strip",
            Converter::Template(_) => "template",
        }
    }
}
