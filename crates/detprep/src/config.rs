// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Pipeline configuration.
//!
//! Values are layered, later layers winning:
//!
//! 1. built-in defaults
//! 2. a TOML file (`--config`, else `detprep.toml` in the user config
//!    directory, if present)
//! 3. `DETPREP_*` environment variables, e.g. `DETPREP_MAX_ITERATIONS=500` or
//!    `DETPREP_TRAINER__PROGRAM=/usr/bin/trainer`
//! 4. command line overrides
//!
//! Relative directories in a config file resolve against the file's
//! directory. The result is checked by [`PipelineConfig::validate`] before any
//! stage runs.

use std::path::{Path, PathBuf};

use crate::{Error, dataset::dataset_file, manifest::MANIFEST_FILE};
use config::{Config, Environment, File};
use directories::ProjectDirs;
use log::debug;
use serde::{Deserialize, Serialize};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DETPREP";

/// Default config file name inside the user config directory.
pub const CONFIG_FILE: &str = "detprep.toml";

/// External trainer program and extra arguments passed before the
/// subcommand.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TrainerConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root of every generated directory.
    pub playground_dir: PathBuf,
    /// Annotation tree, one sub-directory per label.
    pub annotations_dir: PathBuf,
    /// Image tree, one sub-directory per label.
    pub images_dir: PathBuf,
    /// Fraction of rows used for training.
    pub train_test_split: f64,
    pub max_iterations: u32,
    pub model_name: String,
    /// Seed of the augmentation pipeline and the train/test split.
    pub seed: u64,
    /// Image file extension, matched case-sensitively.
    pub image_extension: String,
    /// Ask to explore the final dataset after a run.
    pub explore: bool,
    /// Render the original dataset's ground truth into `original/` while
    /// augmenting.
    pub visualize_original: bool,
    /// Dataset to train on, `dataset/final.arrow` when unset.
    pub training_dataset: Option<PathBuf>,
    /// Images to predict on when visualizing results.
    pub test_images_dir: Option<PathBuf>,
    pub trainer: Option<TrainerConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            playground_dir: PathBuf::from("Playground"),
            annotations_dir: PathBuf::from("annotations"),
            images_dir: PathBuf::from("images"),
            train_test_split: 0.8,
            max_iterations: 10000,
            model_name: "heavy_aug".to_string(),
            seed: 1,
            image_extension: "JPEG".to_string(),
            explore: false,
            visualize_original: false,
            training_dataset: None,
            test_images_dir: None,
            trainer: None,
        }
    }
}

/// Values given on the command line. `None` keeps the configured value.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub playground_dir: Option<PathBuf>,
    pub annotations_dir: Option<PathBuf>,
    pub images_dir: Option<PathBuf>,
    pub train_test_split: Option<f64>,
    pub max_iterations: Option<u32>,
    pub model_name: Option<String>,
    pub seed: Option<u64>,
    pub visualize_original: Option<bool>,
    pub training_dataset: Option<PathBuf>,
    pub test_images_dir: Option<PathBuf>,
    pub trainer_program: Option<PathBuf>,
}

/// Path of the default config file, if a user config directory exists.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("ai", "EdgeFirst", "detprep").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

fn resolve(base: &Path, path: &mut PathBuf) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

impl PipelineConfig {
    /// Load defaults, the config file and environment variables.
    ///
    /// An explicit `path` must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let (file, required) = match path {
            Some(path) => (Some(path.to_path_buf()), true),
            None => (default_config_path(), false),
        };
        Self::load_with_env(file.as_deref(), required, Environment::with_prefix(ENV_PREFIX))
    }

    fn load_with_env(file: Option<&Path>, required: bool, env: Environment) -> Result<Self, Error> {
        let mut builder = Config::builder();
        if let Some(file) = file {
            debug!("loading configuration from {:?} (required: {})", file, required);
            builder = builder.add_source(File::from(file).required(required));
        }
        let settings = builder
            .add_source(env.prefix_separator("_").separator("__").try_parsing(true))
            .build()?;
        let mut config: PipelineConfig = settings.try_deserialize()?;

        if let Some(file) = file
            && file.exists()
            && let Some(base) = file.parent()
        {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    /// Make relative directories absolute against `base`.
    pub fn resolve_relative_to(&mut self, base: &Path) {
        resolve(base, &mut self.playground_dir);
        resolve(base, &mut self.annotations_dir);
        resolve(base, &mut self.images_dir);
        if let Some(path) = self.training_dataset.as_mut() {
            resolve(base, path);
        }
        if let Some(path) = self.test_images_dir.as_mut() {
            resolve(base, path);
        }
        if let Some(trainer) = self.trainer.as_mut()
            && trainer.program.components().count() > 1
        {
            resolve(base, &mut trainer.program);
        }
    }

    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(v) = overrides.playground_dir {
            self.playground_dir = v;
        }
        if let Some(v) = overrides.annotations_dir {
            self.annotations_dir = v;
        }
        if let Some(v) = overrides.images_dir {
            self.images_dir = v;
        }
        if let Some(v) = overrides.train_test_split {
            self.train_test_split = v;
        }
        if let Some(v) = overrides.max_iterations {
            self.max_iterations = v;
        }
        if let Some(v) = overrides.model_name {
            self.model_name = v;
        }
        if let Some(v) = overrides.seed {
            self.seed = v;
        }
        if let Some(v) = overrides.visualize_original {
            self.visualize_original = v;
        }
        if let Some(v) = overrides.training_dataset {
            self.training_dataset = Some(v);
        }
        if let Some(v) = overrides.test_images_dir {
            self.test_images_dir = Some(v);
        }
        if let Some(program) = overrides.trainer_program {
            match self.trainer.as_mut() {
                Some(trainer) => trainer.program = program,
                None => {
                    self.trainer = Some(TrainerConfig {
                        program,
                        args: Vec::new(),
                    })
                }
            }
        }
    }

    /// Reject values no stage can work with.
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.train_test_split > 0.0 && self.train_test_split < 1.0) {
            return Err(Error::InvalidParameters(format!(
                "train_test_split must be between 0 and 1 (exclusive), got {}",
                self.train_test_split
            )));
        }
        if self.max_iterations == 0 {
            return Err(Error::InvalidParameters(
                "max_iterations must be greater than zero".to_string(),
            ));
        }
        if self.model_name.trim().is_empty() || self.model_name.contains(['/', '\\']) {
            return Err(Error::InvalidParameters(format!(
                "model_name must be a non-empty file name, got {:?}",
                self.model_name
            )));
        }
        if self.image_extension.is_empty() || self.image_extension.contains('.') {
            return Err(Error::InvalidParameters(format!(
                "image_extension must be an extension without '.', got {:?}",
                self.image_extension
            )));
        }
        if let Some(trainer) = &self.trainer
            && trainer.program.as_os_str().is_empty()
        {
            return Err(Error::InvalidParameters("trainer program is empty".to_string()));
        }
        Ok(())
    }

    /// Unified image directory produced by cleaning.
    pub fn staging_dir(&self) -> PathBuf {
        self.playground_dir.join("allImages")
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.playground_dir.join("dataset")
    }

    pub fn augmented_dir(&self) -> PathBuf {
        self.playground_dir.join("allAugmentedImages")
    }

    /// Ground truth renders of the original dataset.
    pub fn original_dir(&self) -> PathBuf {
        self.playground_dir.join("original")
    }

    pub fn model_dir(&self) -> PathBuf {
        self.playground_dir.join("model")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.playground_dir.join(MANIFEST_FILE)
    }

    pub fn training_dataset(&self) -> PathBuf {
        self.training_dataset
            .clone()
            .unwrap_or_else(|| dataset_file(&self.dataset_dir(), "final"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn no_env() -> Environment {
        Environment::with_prefix(ENV_PREFIX).source(Some(HashMap::new()))
    }

    #[test]
    fn test_defaults_are_valid() -> Result<(), Error> {
        let config = PipelineConfig::load_with_env(None, false, no_env())?;
        assert_eq!(config, PipelineConfig::default());
        config.validate()?;
        assert_eq!(config.model_name, "heavy_aug");
        assert_eq!(config.max_iterations, 10000);
        assert_eq!(
            config.training_dataset(),
            Path::new("Playground").join("dataset").join("final.arrow")
        );
        Ok(())
    }

    #[test]
    fn test_file_and_env_layers() -> Result<(), Error> {
        let temp = TempDir::new()?;
        let file = temp.path().join("detprep.toml");
        std::fs::write(
            &file,
            r#"
playground_dir = "play"
max_iterations = 50
model_name = "light"

[trainer]
program = "bin/trainer"
args = ["--gpus", "0"]
"#,
        )?;

        let env = Environment::with_prefix(ENV_PREFIX).source(Some(HashMap::from([
            ("DETPREP_MAX_ITERATIONS".to_string(), "75".to_string()),
            ("DETPREP_SEED".to_string(), "9".to_string()),
        ])));
        let config = PipelineConfig::load_with_env(Some(&file), true, env)?;

        assert_eq!(config.playground_dir, temp.path().join("play"));
        assert_eq!(config.images_dir, temp.path().join("images"));
        assert_eq!(config.max_iterations, 75);
        assert_eq!(config.seed, 9);
        assert_eq!(config.model_name, "light");
        let trainer = config.trainer.as_ref().expect("trainer section");
        assert_eq!(trainer.program, temp.path().join("bin/trainer"));
        assert_eq!(trainer.args, vec!["--gpus", "0"]);
        Ok(())
    }

    #[test]
    fn test_missing_required_file() {
        let missing = Path::new("/nonexistent/detprep.toml");
        let result = PipelineConfig::load_with_env(Some(missing), true, no_env());
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_overrides() {
        let mut config = PipelineConfig::default();
        config.apply(ConfigOverrides {
            model_name: Some("cli".to_string()),
            train_test_split: Some(0.5),
            trainer_program: Some(PathBuf::from("trainer")),
            visualize_original: Some(true),
            ..Default::default()
        });
        assert_eq!(config.model_name, "cli");
        assert!(config.visualize_original);
        assert_eq!(config.train_test_split, 0.5);
        assert_eq!(config.trainer.map(|t| t.program), Some(PathBuf::from("trainer")));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            PipelineConfig {
                train_test_split: 1.0,
                ..Default::default()
            },
            PipelineConfig {
                train_test_split: 0.0,
                ..Default::default()
            },
            PipelineConfig {
                max_iterations: 0,
                ..Default::default()
            },
            PipelineConfig {
                model_name: " ".to_string(),
                ..Default::default()
            },
            PipelineConfig {
                image_extension: ".JPEG".to_string(),
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(Error::InvalidParameters(_))),
                "{:?}",
                config
            );
        }
    }
}
