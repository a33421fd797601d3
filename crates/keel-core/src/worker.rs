//! Worker types and selector matching.

use crate::ids::WorkerId;
use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Selector value matching any tag value, as long as the key is present.
pub const WILDCARD: &str = "*";

/// A process capable of running stages, advertising capability tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Worker {
    pub id: WorkerId,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Worker {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: WorkerId::new(id),
            tags: BTreeMap::new(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Parse `id:key=value,flag` shorthand, where a bare `flag` means `flag=true`.
    pub fn parse(spec: &str) -> Result<Self> {
        let (id, tags) = match spec.split_once(':') {
            Some((id, tags)) => (id.trim(), tags),
            None => (spec.trim(), ""),
        };
        if id.is_empty() {
            return Err(Error::config(format!("worker `{spec}` has no id")));
        }

        let mut worker = Worker::new(id);
        for tag in tags.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (key, value) = parse_tag(tag);
            if key.is_empty() {
                return Err(Error::config(format!("worker `{id}` has an empty tag key")));
            }
            worker.tags.insert(key.to_string(), value.to_string());
        }
        Ok(worker)
    }

    pub fn satisfies(&self, selector: &WorkerSelector) -> bool {
        selector.matches(&self.tags)
    }
}

fn parse_tag(tag: &str) -> (&str, &str) {
    match tag.split_once('=') {
        Some((k, v)) => (k.trim(), v.trim()),
        None => (tag, "true"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
}

impl WorkerStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, WorkerStatus::Idle)
    }
}

/// Tag constraints a worker must satisfy to be eligible for a stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct WorkerSelector(BTreeMap<String, String>);

impl WorkerSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn from_map(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Every constrained key is present with an equal value, or any value for `*`.
    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(key, want)| match tags.get(key) {
            Some(_) if want == WILDCARD => true,
            Some(have) => have == want,
            None => false,
        })
    }
}

impl fmt::Display for WorkerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<any>");
        }
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        f.write_str(&parts.join(","))
    }
}
