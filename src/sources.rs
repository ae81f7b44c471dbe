//! Source definitions and the catalog holding the current snapshot.
//!
//! Sources are read from a TOML file of `[[source]]` tables. A loaded file
//! becomes an immutable [`SourceSet`]; the [`SourceCatalog`] hands out
//! `Arc`s to the current set and swaps in a new one on reload. Readers that
//! took a snapshot keep using it until they drop it.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

use crate::config::MAX_FETCH_INTERVAL_SECS;
use crate::filter::{FilterError, FilterRule, RuleSet};
use crate::util::{validate_source_url, HostPolicy, UrlValidationError};

/// Maximum sources file size (1 MB), same limit as the config file.
const MAX_FILE_SIZE: u64 = 1_048_576;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to read sources file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML in sources file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Sources file too large: {0} bytes (max 1048576 bytes)")]
    TooLarge(u64),

    #[error("Source with empty id at position {0}")]
    EmptyId(usize),

    #[error("Duplicate source id: {0}")]
    DuplicateId(String),

    #[error("Source {id}: invalid url: {source}")]
    InvalidUrl {
        id: String,
        #[source]
        source: UrlValidationError,
    },

    #[error("Source {id}: interval_secs must be between 1 and 2592000")]
    InvalidInterval { id: String },

    #[error("Source {id}: {source}")]
    InvalidRule {
        id: String,
        #[source]
        source: FilterError,
    },

    #[error("Catalog was not loaded from a file and cannot be reloaded")]
    NotReloadable,
}

// ============================================================================
// File Format
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct SourcesFile {
    #[serde(default)]
    source: Vec<RawSource>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    id: String,
    name: Option<String>,
    url: String,
    interval_secs: Option<u64>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    rules: Vec<FilterRule>,
}

fn default_enabled() -> bool {
    true
}

// ============================================================================
// Definitions
// ============================================================================

/// One configured source. Immutable once part of a [`SourceSet`].
#[derive(Debug, Clone)]
pub struct SourceDefinition {
    pub id: String,
    pub name: String,
    pub url: String,
    /// Overrides the scheduler's global fetch interval
    pub interval: Option<Duration>,
    pub enabled: bool,
    pub rules: Vec<FilterRule>,
    rule_set: RuleSet,
}

impl SourceDefinition {
    /// An enabled source with no rules and the global interval.
    pub fn new(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            interval: None,
            enabled: true,
            rules: Vec::new(),
            rule_set: RuleSet::default(),
        }
    }

    /// Replace the rules, compiling them.
    pub fn with_rules(mut self, rules: Vec<FilterRule>) -> Result<Self, FilterError> {
        self.rule_set = RuleSet::compile(&rules)?;
        self.rules = rules;
        Ok(self)
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn rule_set(&self) -> &RuleSet {
        &self.rule_set
    }

    /// The source's own interval, else `default`.
    pub fn interval_or(&self, default: Duration) -> Duration {
        self.interval.unwrap_or(default)
    }

    fn from_raw(raw: RawSource, policy: HostPolicy) -> Result<Self, SourceError> {
        let id = raw.id.trim().to_string();
        let url = validate_source_url(&raw.url, policy).map_err(|source| {
            SourceError::InvalidUrl {
                id: id.clone(),
                source,
            }
        })?;
        if matches!(raw.interval_secs, Some(secs) if secs == 0 || secs > MAX_FETCH_INTERVAL_SECS) {
            return Err(SourceError::InvalidInterval { id });
        }

        let name = raw
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| id.clone());

        let definition = SourceDefinition::new(id.clone(), name, url.to_string())
            .with_enabled(raw.enabled)
            .with_rules(raw.rules)
            .map_err(|source| SourceError::InvalidRule {
                id: id.clone(),
                source,
            })?;

        Ok(match raw.interval_secs {
            Some(secs) => definition.with_interval(Duration::from_secs(secs)),
            None => definition,
        })
    }
}

/// An immutable, validated set of sources with unique ids.
#[derive(Debug, Default)]
pub struct SourceSet {
    sources: Vec<Arc<SourceDefinition>>,
    index: HashMap<String, usize>,
}

impl SourceSet {
    /// Build a set, rejecting empty and duplicate ids.
    pub fn new(definitions: Vec<SourceDefinition>) -> Result<Self, SourceError> {
        let mut set = SourceSet::default();
        for (position, definition) in definitions.into_iter().enumerate() {
            if definition.id.is_empty() {
                return Err(SourceError::EmptyId(position));
            }
            if set.index.contains_key(&definition.id) {
                return Err(SourceError::DuplicateId(definition.id));
            }
            set.index.insert(definition.id.clone(), set.sources.len());
            set.sources.push(Arc::new(definition));
        }
        Ok(set)
    }

    /// Parse a sources document.
    pub fn from_toml(content: &str, policy: HostPolicy) -> Result<Self, SourceError> {
        let file: SourcesFile = toml::from_str(content)?;
        let definitions = file
            .source
            .into_iter()
            .map(|raw| SourceDefinition::from_raw(raw, policy))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(definitions)
    }

    pub fn load(path: &Path, policy: HostPolicy) -> Result<Self, SourceError> {
        let io_error = |source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        };
        let meta = std::fs::metadata(path).map_err(io_error)?;
        if meta.len() > MAX_FILE_SIZE {
            return Err(SourceError::TooLarge(meta.len()));
        }
        let content = std::fs::read_to_string(path).map_err(io_error)?;
        Self::from_toml(&content, policy)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<SourceDefinition>> {
        self.index.get(id).map(|&i| &self.sources[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Sources in file order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<SourceDefinition>> {
        self.sources.iter()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.sources.iter().filter(|s| s.enabled).count()
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// Holds the current [`SourceSet`] snapshot.
#[derive(Debug)]
pub struct SourceCatalog {
    current: RwLock<Arc<SourceSet>>,
    path: Option<PathBuf>,
    policy: HostPolicy,
}

impl SourceCatalog {
    /// A catalog over a fixed set; [`reload`](Self::reload) is unavailable.
    pub fn new(set: SourceSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(set)),
            path: None,
            policy: HostPolicy::default(),
        }
    }

    /// Load the initial snapshot from `path`. Later reloads re-read it.
    pub fn from_file(path: &Path, policy: HostPolicy) -> Result<Self, SourceError> {
        let set = SourceSet::load(path, policy)?;
        tracing::info!(
            path = %path.display(),
            sources = set.len(),
            enabled = set.enabled_count(),
            "Loaded sources"
        );
        Ok(Self {
            current: RwLock::new(Arc::new(set)),
            path: Some(path.to_path_buf()),
            policy,
        })
    }

    pub fn snapshot(&self) -> Arc<SourceSet> {
        // Poisoning only means a writer panicked mid-swap; the Arc is still whole
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the current snapshot, returning the installed one.
    pub fn install(&self, set: SourceSet) -> Arc<SourceSet> {
        let set = Arc::new(set);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&set);
        set
    }

    /// Re-read the sources file. On error the current snapshot stays in place.
    pub fn reload(&self) -> Result<Arc<SourceSet>, SourceError> {
        let path = self.path.as_deref().ok_or(SourceError::NotReloadable)?;
        match SourceSet::load(path, self.policy) {
            Ok(set) => {
                tracing::info!(
                    path = %path.display(),
                    sources = set.len(),
                    enabled = set.enabled_count(),
                    "Reloaded sources"
                );
                Ok(self.install(set))
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Sources reload failed, keeping previous snapshot");
                Err(e)
            }
        }
    }
}
