//! Classifier-name-to-index map
//!
//! When separate contextual-embedding mixtures per classifier are enabled,
//! every distinct classifier name needs a stable integer index selecting its
//! mixture. The map is persisted to `<run_dir>/classifier_task_map.json` so
//! assignments survive across separate pretraining and target-task runs.
//! Indices grow monotonically and are never reassigned; the default pretrain
//! classifier always occupies index 0.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{ModelError, Result};

/// Name of the default pretrain classifier; always index 0.
pub const PRETRAIN_CLASSIFIER: &str = "@pretrain@";

/// File name under the run directory.
pub const CLASSIFIER_MAP_FILE: &str = "classifier_task_map.json";

/// Persistent mapping from classifier name to mixture index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierNameMap {
    map: BTreeMap<String, usize>,
}

impl ClassifierNameMap {
    /// Path of the map file under a run directory.
    pub fn path_for(run_dir: &Path) -> PathBuf {
        run_dir.join(CLASSIFIER_MAP_FILE)
    }

    /// A fresh map containing only the pretrain classifier at index 0.
    pub fn fresh() -> Self {
        let mut map = BTreeMap::new();
        map.insert(PRETRAIN_CLASSIFIER.to_string(), 0);
        Self { map }
    }

    /// Load the persisted map, or start fresh when none exists.
    ///
    /// A missing file is only legal on a fresh pretraining run
    /// (`allow_fresh`); a continuation run without the file is a
    /// configuration error. A file that exists but violates the map's
    /// invariants (hand-edited, torn by an unrelated writer) is rejected
    /// rather than silently skewing the mixture bookkeeping.
    pub fn load_or_init(run_dir: &Path, allow_fresh: bool) -> Result<Self> {
        let path = Self::path_for(run_dir);
        if path.is_file() {
            let raw = std::fs::read_to_string(&path)?;
            let map: BTreeMap<String, usize> = serde_json::from_str(&raw)?;
            validate(&map, &path)?;
            Ok(Self { map })
        } else if allow_fresh {
            warn!(path = %path.display(), "classifier task map not found; starting a new one");
            Ok(Self::fresh())
        } else {
            Err(ModelError::MissingClassifierMap(
                path.display().to_string(),
            ))
        }
    }

    /// Assign indices to any names not yet in the map, preserving every
    /// existing assignment. New names are taken in sorted order and receive
    /// monotonically increasing indices.
    pub fn assign<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        let sorted: BTreeSet<&str> = names.into_iter().collect();
        let max_assigned = self.map.values().copied().max().unwrap_or(0);
        let mut offset = 1;
        for name in sorted {
            if !self.map.contains_key(name) {
                self.map.insert(name.to_string(), max_assigned + offset);
                offset += 1;
            }
        }
        info!(classifiers = ?self.map, "classifier index assignments");
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.map.get(name).copied()
    }

    /// Number of mixture slots the contextual embedder must expose:
    /// one plus the maximum assigned index.
    pub fn n_mixtures(&self) -> usize {
        1 + self.map.values().copied().max().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate `(name, index)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.map.iter().map(|(k, &v)| (k.as_str(), v))
    }

    /// Rewrite the map file atomically (write to a temp file in the run
    /// directory, then rename over the target).
    pub fn save(&self, run_dir: &Path) -> Result<()> {
        let path = Self::path_for(run_dir);
        let mut tmp = tempfile::NamedTempFile::new_in(run_dir)?;
        tmp.write_all(serde_json::to_string(&self.map)?.as_bytes())?;
        tmp.persist(&path).map_err(|e| ModelError::Io(e.error))?;
        Ok(())
    }
}

/// Check the invariants a persisted map must satisfy: the pretrain
/// classifier at index 0 and indices covering `0..K-1` without gaps or
/// repeats.
fn validate(map: &BTreeMap<String, usize>, path: &Path) -> Result<()> {
    let corrupt = |reason: &str| {
        ModelError::CorruptClassifierMap(path.display().to_string(), reason.to_string())
    };
    if map.get(PRETRAIN_CLASSIFIER) != Some(&0) {
        return Err(corrupt("the pretrain classifier must hold index 0"));
    }
    let mut indices: Vec<usize> = map.values().copied().collect();
    indices.sort_unstable();
    if indices != (0..map.len()).collect::<Vec<usize>>() {
        return Err(corrupt("indices must cover 0..K-1 without gaps or repeats"));
    }
    Ok(())
}
