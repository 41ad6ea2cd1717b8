use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::converter::ConvertError;

/// Client model name -> Azure deployment name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentMapping {
    entries: HashMap<String, String>,
}

impl DeploymentMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, model: impl Into<String>, deployment: impl Into<String>) {
        self.entries.insert(model.into(), deployment.into());
    }

    pub fn get(&self, model: &str) -> Option<&str> {
        self.entries.get(model).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<M: Into<String>, D: Into<String>> FromIterator<(M, D)> for DeploymentMapping {
    fn from_iter<T: IntoIterator<Item = (M, D)>>(iter: T) -> Self {
        let mut mapping = Self::new();
        for (model, deployment) in iter {
            mapping.insert(model, deployment);
        }
        mapping
    }
}

impl From<&BTreeMap<String, String>> for DeploymentMapping {
    fn from(value: &BTreeMap<String, String>) -> Self {
        value
            .iter()
            .map(|(model, deployment)| (model.clone(), deployment.clone()))
            .collect()
    }
}

/// Read-mostly resolver. The table is swapped as a whole, so readers see
/// either the old mapping or the new one, never a mix.
#[derive(Debug)]
pub struct DeploymentResolver {
    mapping: ArcSwap<DeploymentMapping>,
}

impl DeploymentResolver {
    pub fn new(mapping: DeploymentMapping) -> Self {
        Self {
            mapping: ArcSwap::from_pointee(mapping),
        }
    }

    pub fn resolve(&self, model: &str) -> Result<String, ConvertError> {
        self.mapping
            .load()
            .get(model)
            .map(str::to_string)
            .ok_or_else(|| ConvertError::UnknownModel(model.to_string()))
    }

    pub fn replace(&self, mapping: DeploymentMapping) {
        self.mapping.store(Arc::new(mapping));
    }

    pub fn snapshot(&self) -> Arc<DeploymentMapping> {
        self.mapping.load_full()
    }
}
