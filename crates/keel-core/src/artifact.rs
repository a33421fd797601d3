//! Collected artifacts.

use crate::ids::StageId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A file produced by a stage, read back after its commands ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub stage: StageId,
    /// Path relative to the stage's working directory, `/`-separated.
    pub path: String,
    /// Declared pattern that matched this file.
    pub pattern: String,
    pub size: u64,
    pub sha256: String,
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl Artifact {
    pub fn new(
        stage: StageId,
        pattern: impl Into<String>,
        path: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        let sha256 = hex::encode(Sha256::digest(&data));
        Self {
            stage,
            path: path.into(),
            pattern: pattern.into(),
            size: data.len() as u64,
            sha256,
            data,
        }
    }

    /// Collection key: stage label plus path.
    pub fn key(&self) -> String {
        format!("{}/{}", self.stage, self.path)
    }
}

/// All artifacts of a run, keyed by stage label + path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactCollection(BTreeMap<String, Artifact>);

impl ArtifactCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an artifact. The same stage producing the same path twice (two
    /// patterns matching one file) keeps the first; different stages landing
    /// on the same key is a collision.
    pub fn insert(&mut self, artifact: Artifact) -> Result<()> {
        let key = artifact.key();
        match self.0.get(&key) {
            Some(existing) if existing.stage == artifact.stage && existing.path == artifact.path => {
                Ok(())
            }
            Some(existing) => Err(Error::ArtifactCollision {
                key,
                first: existing.stage.to_string(),
                second: artifact.stage.to_string(),
            }),
            None => {
                self.0.insert(key, artifact);
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Artifact> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Artifact)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn total_bytes(&self) -> u64 {
        self.0.values().map(|a| a.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_and_size() {
        let artifact = Artifact::new(StageId::new("Build"), "Cargo.lock", "Cargo.lock", b"abc".to_vec());
        assert_eq!(artifact.size, 3);
        assert_eq!(
            artifact.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(artifact.key(), "Build/Cargo.lock");
    }

    #[test]
    fn test_same_stage_duplicate_is_deduplicated() {
        let mut collection = ArtifactCollection::new();
        collection
            .insert(Artifact::new(StageId::new("Build"), "*.lock", "Cargo.lock", vec![1]))
            .unwrap();
        collection
            .insert(Artifact::new(StageId::new("Build"), "Cargo.lock", "Cargo.lock", vec![1]))
            .unwrap();
        assert_eq!(collection.len(), 1);
        assert_eq!(collection.get("Build/Cargo.lock").unwrap().pattern, "*.lock");
    }

    #[test]
    fn test_cross_stage_collision() {
        let mut collection = ArtifactCollection::new();
        collection
            .insert(Artifact::new(StageId::new("a/b"), "c", "c", vec![]))
            .unwrap();
        let err = collection
            .insert(Artifact::new(StageId::new("a"), "b/c", "b/c", vec![]))
            .unwrap_err();
        assert!(matches!(err, Error::ArtifactCollision { ref key, .. } if key == "a/b/c"));
    }
}
