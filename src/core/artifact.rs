//! Artifacts handed between pipeline stages

use serde::{Deserialize, Serialize};
use std::path::Path;
use crate::core::error::ConfigError;

/// Which slot an artifact lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactKind {
    /// Uploaded source bundle, produced by Source, consumed by Build
    Source,
    /// Image-definitions manifest, produced by Build, consumed by Deploy
    Build,
}

/// An opaque payload passed between stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    /// Where the payload came from (object key or build id)
    pub origin: String,
    pub payload: Vec<u8>,
}

/// Named handle owned by exactly one pipeline.
///
/// Populated once per run; the next run overwrites it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSlot {
    pub name: String,
    pub kind: ArtifactKind,
    content: Option<Artifact>,
}

impl ArtifactSlot {
    pub fn new(name: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            name: name.into(),
            kind,
            content: None,
        }
    }

    pub fn populate(&mut self, origin: impl Into<String>, payload: Vec<u8>) -> &Artifact {
        self.content.insert(Artifact {
            kind: self.kind,
            origin: origin.into(),
            payload,
        })
    }

    pub fn get(&self) -> Option<&Artifact> {
        self.content.as_ref()
    }

    pub fn is_populated(&self) -> bool {
        self.content.is_some()
    }

    pub fn clear(&mut self) {
        self.content = None;
    }
}

/// One entry of the image-definitions manifest emitted by a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDefinition {
    pub name: String,
    pub image_uri: String,
}

/// Find the image for `container` in a build artifact
pub fn image_for_container(payload: &[u8], container: &str) -> Result<String, String> {
    let definitions: Vec<ImageDefinition> = serde_json::from_slice(payload)
        .map_err(|e| format!("malformed image definitions: {}", e))?;
    definitions
        .into_iter()
        .find(|d| d.name == container)
        .map(|d| d.image_uri)
        .ok_or_else(|| format!("no image definition for container '{}'", container))
}

/// Encode an image-definitions manifest
pub fn image_definitions(container: &str, image_uri: &str) -> Vec<u8> {
    let definitions = vec![ImageDefinition {
        name: container.to_string(),
        image_uri: image_uri.to_string(),
    }];
    serde_json::to_vec(&definitions).unwrap_or_default()
}

/// Build instructions, passed to the build environment without interpretation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BuildSpec(String);

impl BuildSpec {
    pub fn inline(content: impl Into<String>) -> Self {
        Self(content.into())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::MissingBuildSpec(path.display().to_string()));
        }
        std::fs::read_to_string(path)
            .map(Self)
            .map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
