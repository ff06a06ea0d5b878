// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Sequential stage runner.
//!
//! Stages run in the order clean, convert, augment, train. Before a stage
//! runs, the runner hashes its inputs together with the settings that shape
//! its output and consults the [`Manifest`]: a stage
//! that completed on identical inputs and whose output is still present is
//! skipped. Otherwise its output is cleared, it runs, and its completion is
//! recorded with the hash of its inputs as they are afterwards.

use std::{
    path::{Path, PathBuf},
    sync::mpsc::Sender,
};

use crate::{
    Error,
    annotations::AnnotationConverter,
    augment::{Augmentor, augment_data},
    cleaner::{CleaningReport, clean_data},
    config::PipelineConfig,
    dataset::{Dataset, dataset_file},
    manifest::{Manifest, Stage, hash_inputs},
    training::{CommandDetector, Detector, TrainingDriver, TrainingReport, visualize_results},
    utils::{Progress, make_dir, reset_dir},
    visualize::visualize_original,
};
use log::info;
use serde_json::{Value, json};

/// What happened to a stage during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Ran,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageOutcome {
    pub stage: Stage,
    pub status: StageStatus,
}

pub struct PipelineRunner {
    config: PipelineConfig,
    manifest: Manifest,
    progress: Option<Sender<Progress>>,
}

impl PipelineRunner {
    /// Validate `config` and load the playground's manifest.
    pub fn new(config: PipelineConfig) -> Result<Self, Error> {
        config.validate()?;
        make_dir(&config.playground_dir)?;
        let manifest = Manifest::load(&config.manifest_path())?;
        Ok(Self {
            config,
            manifest,
            progress: None,
        })
    }

    /// Send per-item progress of every stage to `progress`.
    pub fn with_progress(mut self, progress: Sender<Progress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    fn inputs(&self, stage: Stage) -> Vec<PathBuf> {
        let config = &self.config;
        match stage {
            Stage::Clean => vec![config.annotations_dir.clone(), config.images_dir.clone()],
            Stage::Convert => vec![config.annotations_dir.clone(), config.staging_dir()],
            Stage::Augment => vec![dataset_file(&config.dataset_dir(), "original")],
            Stage::Train => vec![config.training_dataset()],
        }
    }

    fn output(&self, stage: Stage) -> PathBuf {
        match stage {
            Stage::Clean => self.config.staging_dir(),
            Stage::Convert => dataset_file(&self.config.dataset_dir(), "original"),
            Stage::Augment => dataset_file(&self.config.dataset_dir(), "final"),
            Stage::Train => self.config.model_dir(),
        }
    }

    /// Configuration that decides the output of `stage`.
    fn params(&self, stage: Stage) -> Value {
        let config = &self.config;
        match stage {
            Stage::Clean | Stage::Convert => json!({ "image_extension": config.image_extension }),
            Stage::Augment => json!({
                "seed": config.seed,
                "visualize_original": config.visualize_original,
            }),
            Stage::Train => json!({
                "seed": config.seed,
                "train_test_split": config.train_test_split,
                "max_iterations": config.max_iterations,
                "model_name": config.model_name,
                "trainer": config.trainer,
            }),
        }
    }

    fn inputs_hash(&self, stage: Stage) -> Result<String, Error> {
        let inputs = self.inputs(stage);
        let roots: Vec<&Path> = inputs.iter().map(PathBuf::as_path).collect();
        hash_inputs(&roots, &self.params(stage))
    }

    /// True when `stage` completed on its current inputs and its output is
    /// still present.
    pub fn is_up_to_date(&self, stage: Stage) -> Result<bool, Error> {
        let hash = self.inputs_hash(stage)?;
        Ok(self.output(stage).exists() && self.manifest.is_complete(stage, &hash))
    }

    fn run_stage<T>(
        &mut self,
        stage: Stage,
        body: impl FnOnce(&mut Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.manifest.mark_started(stage);
        self.manifest.save()?;
        let result = body(self)?;
        let hash = self.inputs_hash(stage)?;
        self.manifest.mark_complete(stage, hash);
        self.manifest.save()?;
        Ok(result)
    }

    /// Reconcile the input trees and stage the images into `allImages/`.
    pub fn clean(&mut self) -> Result<CleaningReport, Error> {
        self.run_stage(Stage::Clean, |runner| {
            let config = &runner.config;
            reset_dir(&config.staging_dir())?;
            clean_data(
                &config.annotations_dir,
                &config.images_dir,
                &config.staging_dir(),
                &config.image_extension,
                runner.progress.clone(),
            )
        })
    }

    /// Convert the annotations into `dataset/original.arrow`.
    pub fn convert(&mut self) -> Result<usize, Error> {
        self.run_stage(Stage::Convert, |runner| {
            let config = &runner.config;
            reset_dir(&config.dataset_dir())?;
            let dataset = AnnotationConverter::new(config.image_extension.clone()).convert(
                &config.annotations_dir,
                &config.staging_dir(),
                runner.progress.clone(),
            )?;
            dataset.save(&dataset_file(&config.dataset_dir(), "original"))?;
            Ok(dataset.len())
        })
    }

    /// Augment the original dataset into `allAugmentedImages/` and write
    /// `dataset/augmented.arrow` and `dataset/final.arrow`. With
    /// `visualize_original` set, the original ground truth is also rendered
    /// into `original/`.
    pub fn augment(&mut self) -> Result<usize, Error> {
        self.run_stage(Stage::Augment, |runner| {
            let config = &runner.config;
            reset_dir(&config.augmented_dir())?;
            if config.visualize_original {
                reset_dir(&config.original_dir())?;
                let original = Dataset::load(&dataset_file(&config.dataset_dir(), "original"))?;
                visualize_original(&original, &config.original_dir())?;
            }
            let mut augmentor = Augmentor::with_seed(config.seed);
            let (_, combined) = augment_data(
                &config.dataset_dir(),
                &config.augmented_dir(),
                &mut augmentor,
                runner.progress.clone(),
            )?;
            Ok(combined.len())
        })
    }

    /// Train with the configured external trainer.
    pub fn train(&mut self) -> Result<TrainingReport, Error> {
        let detector = CommandDetector::new(self.trainer()?, self.config.model_dir().join("work"));
        self.train_with(detector)
    }

    /// Train `detector` on the training dataset, writing into `model/`.
    pub fn train_with<D: Detector>(&mut self, detector: D) -> Result<TrainingReport, Error> {
        self.run_stage(Stage::Train, |runner| {
            let config = &runner.config;
            reset_dir(&config.model_dir())?;
            let mut driver = TrainingDriver::new(
                detector,
                config.train_test_split,
                config.max_iterations,
                config.model_name.clone(),
                config.seed,
            );
            driver.train(&config.training_dataset(), &config.model_dir())
        })
    }

    /// Predict with the saved model over the test images and write the
    /// results into `predictions/`.
    pub fn visualize(&self) -> Result<Vec<PathBuf>, Error> {
        let config = &self.config;
        let model = config.model_dir().join(format!("{}.model", config.model_name));
        let work_dir = config.model_dir().join("work");
        let detector = CommandDetector::load(self.trainer()?, &model, work_dir)?;
        let test_images = config
            .test_images_dir
            .clone()
            .unwrap_or_else(|| config.staging_dir());
        visualize_results(
            &detector,
            &test_images,
            &config.playground_dir.join("predictions"),
            config.seed,
        )
    }

    fn trainer(&self) -> Result<crate::config::TrainerConfig, Error> {
        self.config
            .trainer
            .clone()
            .ok_or_else(|| Error::InvalidParameters("no trainer program configured".to_string()))
    }

    fn stage(&mut self, stage: Stage) -> Result<StageOutcome, Error> {
        if self.is_up_to_date(stage)? {
            info!("{}: using results from previous run", stage);
            return Ok(StageOutcome {
                stage,
                status: StageStatus::Skipped,
            });
        }
        info!("{}: running", stage);
        match stage {
            Stage::Clean => {
                self.clean()?;
            }
            Stage::Convert => {
                self.convert()?;
            }
            Stage::Augment => {
                self.augment()?;
            }
            Stage::Train => {
                self.train()?;
            }
        }
        Ok(StageOutcome {
            stage,
            status: StageStatus::Ran,
        })
    }

    /// Run every stage that is not up to date. Training runs only when a
    /// trainer program is configured.
    pub fn run(&mut self) -> Result<Vec<StageOutcome>, Error> {
        let mut outcomes = Vec::new();
        for stage in Stage::ALL {
            if stage == Stage::Train && self.config.trainer.is_none() {
                info!("train: no trainer configured, skipping");
                continue;
            }
            outcomes.push(self.stage(stage)?);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use tempfile::TempDir;

    fn config(root: &Path) -> Result<PipelineConfig, Error> {
        for (label, stems) in [("cat", ["a", "b"]), ("dog", ["c", "d"])] {
            let ann = root.join("annotations").join(label);
            let img = root.join("images").join(label);
            std::fs::create_dir_all(&ann)?;
            std::fs::create_dir_all(&img)?;
            for stem in stems {
                std::fs::write(
                    ann.join(format!("{}.xml", stem)),
                    format!(
                        "<annotation><filename>{}</filename>\
                         <xmin>4</xmin><ymin>4</ymin><xmax>20</xmax><ymax>20</ymax>\
                         </annotation>",
                        stem
                    ),
                )?;
                RgbImage::from_pixel(32, 32, Rgb([60, 120, 180]))
                    .save_with_format(img.join(format!("{}.JPEG", stem)), ImageFormat::Jpeg)?;
            }
        }
        Ok(PipelineConfig {
            playground_dir: root.join("Playground"),
            annotations_dir: root.join("annotations"),
            images_dir: root.join("images"),
            ..Default::default()
        })
    }

    #[test]
    fn test_run_then_skip() -> Result<(), Error> {
        let temp = TempDir::new()?;
        let config = config(temp.path())?;

        let mut runner = PipelineRunner::new(config.clone())?;
        let outcomes = runner.run()?;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.status == StageStatus::Ran));
        assert!(config.staging_dir().join("a.JPEG").is_file());
        assert!(config.augmented_dir().join("3.JPEG").is_file());

        let mut runner = PipelineRunner::new(config.clone())?;
        let outcomes = runner.run()?;
        assert!(outcomes.iter().all(|o| o.status == StageStatus::Skipped));

        // new input invalidates cleaning, and conversion with it
        std::fs::write(temp.path().join("annotations/cat/e.xml"), "<annotation/>")?;
        let mut runner = PipelineRunner::new(config)?;
        let outcomes = runner.run()?;
        assert_eq!(outcomes[0].status, StageStatus::Ran);
        assert!(!temp.path().join("annotations/cat/e.xml").exists());
        Ok(())
    }

    #[test]
    fn test_deleted_output_reruns() -> Result<(), Error> {
        let temp = TempDir::new()?;
        let config = config(temp.path())?;
        PipelineRunner::new(config.clone())?.run()?;

        std::fs::remove_file(dataset_file(&config.dataset_dir(), "final"))?;
        let outcomes = PipelineRunner::new(config)?.run()?;
        let statuses: Vec<_> = outcomes.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            vec![StageStatus::Skipped, StageStatus::Skipped, StageStatus::Ran]
        );
        Ok(())
    }

    #[test]
    fn test_changed_seed_reruns_augment() -> Result<(), Error> {
        let temp = TempDir::new()?;
        let config = config(temp.path())?;
        PipelineRunner::new(config.clone())?.run()?;
        let first = std::fs::read(config.augmented_dir().join("0.JPEG"))?;

        let reseeded = PipelineConfig {
            seed: 99,
            ..config.clone()
        };
        let outcomes = PipelineRunner::new(reseeded.clone())?.run()?;
        let statuses: Vec<_> = outcomes.iter().map(|o| (o.stage, o.status)).collect();
        assert_eq!(
            statuses,
            vec![
                (Stage::Clean, StageStatus::Skipped),
                (Stage::Convert, StageStatus::Skipped),
                (Stage::Augment, StageStatus::Ran),
            ]
        );
        assert!(config.augmented_dir().join("0.JPEG").is_file());

        // same seed again reuses the seed 99 output
        let outcomes = PipelineRunner::new(reseeded)?.run()?;
        assert!(outcomes.iter().all(|o| o.status == StageStatus::Skipped));

        // back to the first seed reproduces the first images
        let outcomes = PipelineRunner::new(config.clone())?.run()?;
        assert_eq!(outcomes[2].status, StageStatus::Ran);
        assert_eq!(std::fs::read(config.augmented_dir().join("0.JPEG"))?, first);
        Ok(())
    }

    #[test]
    fn test_augment_renders_original() -> Result<(), Error> {
        let temp = TempDir::new()?;
        let config = config(temp.path())?;
        PipelineRunner::new(config.clone())?.run()?;
        assert!(!config.original_dir().exists());

        let rendering = PipelineConfig {
            visualize_original: true,
            ..config
        };
        let outcomes = PipelineRunner::new(rendering.clone())?.run()?;
        assert_eq!(outcomes[2].status, StageStatus::Ran);
        for n in 0..4 {
            let rendered = image::open(rendering.original_dir().join(format!("{}.JPEG", n)))?;
            // 100px frame on each side of the 32px image
            assert_eq!((rendered.width(), rendered.height()), (232, 232));
        }
        Ok(())
    }

    #[test]
    fn test_training_params_change_train_hash() -> Result<(), Error> {
        let temp = TempDir::new()?;
        let config = config(temp.path())?;
        let runner = PipelineRunner::new(config.clone())?;
        let hash = runner.inputs_hash(Stage::Train)?;
        assert_eq!(hash, runner.inputs_hash(Stage::Train)?);

        let changed = [
            PipelineConfig {
                model_name: "light_aug".to_string(),
                ..config.clone()
            },
            PipelineConfig {
                train_test_split: 0.7,
                ..config.clone()
            },
            PipelineConfig {
                max_iterations: 5,
                ..config.clone()
            },
            PipelineConfig {
                seed: 7,
                ..config.clone()
            },
        ];
        for other in changed {
            assert_ne!(PipelineRunner::new(other)?.inputs_hash(Stage::Train)?, hash);
        }
        // augmentation does not depend on the model name
        let renamed = PipelineConfig {
            model_name: "light_aug".to_string(),
            ..config
        };
        assert_eq!(
            PipelineRunner::new(renamed)?.inputs_hash(Stage::Augment)?,
            runner.inputs_hash(Stage::Augment)?
        );
        Ok(())
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PipelineConfig {
            max_iterations: 0,
            ..Default::default()
        };
        assert!(matches!(PipelineRunner::new(config), Err(Error::InvalidParameters(_))));
    }

    #[test]
    fn test_train_requires_trainer() -> Result<(), Error> {
        let temp = TempDir::new()?;
        let mut runner = PipelineRunner::new(config(temp.path())?)?;
        assert!(matches!(runner.train(), Err(Error::InvalidParameters(_))));
        Ok(())
    }
}
