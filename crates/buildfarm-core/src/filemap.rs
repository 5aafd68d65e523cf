//! File maps: filenames to content digests.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::secret::Credentials;

/// Where a worker can fetch an input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocator {
    pub url: String,
    /// SHA-256 of the content, hex-encoded.
    pub sha256: String,
    /// Never logged.
    pub credentials: Option<Credentials>,
}

/// Inputs a worker must hold before building, by filename.
pub type InputFiles = BTreeMap<String, FileLocator>;

/// Mapping from a relative filename to a hex content digest.
///
/// Used for the inputs of a build request and for the outputs a worker
/// reports when it finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileMap(BTreeMap<String, String>);

impl FileMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, filename: impl Into<String>, digest: impl Into<String>) {
        self.0.insert(filename.into(), digest.into());
    }

    pub fn get(&self, filename: &str) -> Option<&str> {
        self.0.get(filename).map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Digests of a set of input files.
    pub fn of_inputs(inputs: &InputFiles) -> Self {
        inputs
            .iter()
            .map(|(name, locator)| (name.clone(), locator.sha256.clone()))
            .collect()
    }
}

impl FromIterator<(String, String)> for FileMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
