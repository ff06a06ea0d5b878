// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Per-stage completion records.
//!
//! The manifest lives at `<playground>/manifest.json` and maps each
//! [`Stage`] to a [`StageRecord`]. A stage counts as done only when its
//! record is marked complete and the hash of its current inputs matches the
//! hash stored when it finished. Anything else reruns the stage.

use std::{
    collections::BTreeMap,
    fmt::Display,
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use crate::Error;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Manifest file name inside the playground directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Pipeline stages, in execution order.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Clean,
    Convert,
    Augment,
    Train,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Clean, Stage::Convert, Stage::Augment, Stage::Train];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Clean => "clean",
            Stage::Convert => "convert",
            Stage::Augment => "augment",
            Stage::Train => "train",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StageRecord {
    pub stage: Stage,
    pub inputs_hash: String,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Manifest {
    #[serde(skip)]
    path: PathBuf,
    stages: BTreeMap<Stage, StageRecord>,
}

impl Manifest {
    /// Load the manifest at `path`, or start an empty one if the file does not
    /// exist.
    pub fn load(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            debug!("no manifest at {:?}, starting empty", path);
            return Ok(Self {
                path: path.to_path_buf(),
                stages: BTreeMap::new(),
            });
        }
        let mut manifest: Manifest = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        manifest.path = path.to_path_buf();
        Ok(manifest)
    }

    /// Load `<playground>/manifest.json`.
    pub fn in_playground(playground: &Path) -> Result<Self, Error> {
        Self::load(&playground.join(MANIFEST_FILE))
    }

    pub fn save(&self) -> Result<(), Error> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        serde_json::to_writer_pretty(BufWriter::new(File::create(&self.path)?), self)?;
        Ok(())
    }

    pub fn record(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.get(&stage)
    }

    /// True when `stage` completed on inputs hashing to `inputs_hash`.
    pub fn is_complete(&self, stage: Stage, inputs_hash: &str) -> bool {
        self.stages
            .get(&stage)
            .is_some_and(|r| r.completed && r.inputs_hash == inputs_hash)
    }

    /// Record that `stage` is running. Its previous completion no longer
    /// counts, and neither does any later stage's.
    pub fn mark_started(&mut self, stage: Stage) {
        for (_, record) in self.stages.range_mut(stage..) {
            record.completed = false;
            record.completed_at = None;
        }
        self.stages
            .entry(stage)
            .or_insert_with(|| StageRecord {
                stage,
                inputs_hash: String::new(),
                completed: false,
                completed_at: None,
            });
    }

    pub fn mark_complete(&mut self, stage: Stage, inputs_hash: impl Into<String>) {
        self.stages.insert(
            stage,
            StageRecord {
                stage,
                inputs_hash: inputs_hash.into(),
                completed: true,
                completed_at: Some(Utc::now()),
            },
        );
    }
}

/// SHA-256 over the JSON form of `params` followed by the sorted relative
/// paths and sizes of every file below `roots`. Missing roots hash as empty.
pub fn hash_inputs<P: Serialize>(roots: &[&Path], params: &P) -> Result<String, Error> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(params)?);
    hasher.update(b"\n");
    for (idx, root) in roots.iter().enumerate() {
        hasher.update(format!("#{}\n", idx).as_bytes());
        if !root.exists() {
            continue;
        }
        let mut entries = Vec::new();
        for entry in WalkDir::new(root) {
            let entry = entry?;
            if entry.file_type().is_file() {
                let relative = entry.path().strip_prefix(root)?.to_string_lossy().into_owned();
                entries.push((relative, entry.metadata()?.len()));
            }
        }
        for (relative, size) in entries.into_iter().sorted() {
            hasher.update(format!("{}\t{}\n", relative, size).as_bytes());
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hash_inputs_tracks_changes() -> Result<(), Error> {
        let temp = TempDir::new()?;
        let dir = temp.path().join("images");
        std::fs::create_dir_all(dir.join("cat"))?;
        std::fs::write(dir.join("cat/a.JPEG"), b"abc")?;

        let first = hash_inputs(&[&dir], &())?;
        assert_eq!(first, hash_inputs(&[&dir], &())?);
        assert_eq!(first.len(), 64);

        std::fs::write(dir.join("cat/a.JPEG"), b"abcd")?;
        let resized = hash_inputs(&[&dir], &())?;
        assert_ne!(first, resized);

        std::fs::write(dir.join("cat/b.JPEG"), b"x")?;
        assert_ne!(resized, hash_inputs(&[&dir], &())?);

        let nope = temp.path().join("nope");
        let nada = temp.path().join("nada");
        assert_eq!(hash_inputs(&[&nope], &())?, hash_inputs(&[&nada], &())?);
        Ok(())
    }

    #[test]
    fn test_hash_inputs_tracks_params() -> Result<(), Error> {
        let temp = TempDir::new()?;
        let roots = [temp.path()];
        let seeded = |seed: u64| hash_inputs(&roots, &serde_json::json!({ "seed": seed }));
        assert_eq!(seeded(1)?, seeded(1)?);
        assert_ne!(seeded(1)?, seeded(99)?);
        assert_ne!(seeded(1)?, hash_inputs(&roots, &())?);
        Ok(())
    }

    #[test]
    fn test_manifest_completion() -> Result<(), Error> {
        let temp = TempDir::new()?;
        let mut manifest = Manifest::in_playground(temp.path())?;
        assert!(!manifest.is_complete(Stage::Clean, "h1"));

        manifest.mark_started(Stage::Clean);
        assert!(!manifest.is_complete(Stage::Clean, ""));
        manifest.mark_complete(Stage::Clean, "h1");
        manifest.mark_complete(Stage::Convert, "h2");
        manifest.save()?;

        let restored = Manifest::in_playground(temp.path())?;
        assert_eq!(restored, manifest);
        assert!(restored.is_complete(Stage::Clean, "h1"));
        assert!(!restored.is_complete(Stage::Clean, "changed"));
        assert!(restored.record(Stage::Convert).and_then(|r| r.completed_at).is_some());
        Ok(())
    }

    #[test]
    fn test_mark_started_invalidates_later_stages() {
        let mut manifest = Manifest::default();
        manifest.mark_complete(Stage::Clean, "a");
        manifest.mark_complete(Stage::Convert, "b");
        manifest.mark_complete(Stage::Augment, "c");

        manifest.mark_started(Stage::Convert);
        assert!(manifest.is_complete(Stage::Clean, "a"));
        assert!(!manifest.is_complete(Stage::Convert, "b"));
        assert!(!manifest.is_complete(Stage::Augment, "c"));
    }

    #[test]
    fn test_stage_serializes_lowercase() -> Result<(), Error> {
        assert_eq!(serde_json::to_string(&Stage::Augment)?, "\"augment\"");
        assert_eq!(Stage::ALL.map(|s| s.to_string()), ["clean", "convert", "augment", "train"]);
        Ok(())
    }
}
