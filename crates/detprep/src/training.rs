// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Detector training, evaluation and export.
//!
//! The detector itself is not implemented here. [`Detector`] is the seam a
//! training backend plugs into; [`CommandDetector`] drives an external trainer
//! program through a small command line protocol:
//!
//! ```text
//! <program> [args..] train    --train <arrow> --max-iterations <n> --model <path>
//! <program> [args..] evaluate --model <path> --test <arrow> --metrics <json>
//! <program> [args..] export   --model <path> --output <path>
//! <program> [args..] predict  --model <path> --input <arrow> --output <arrow> --confidence <f>
//! ```
//!
//! Datasets are exchanged as Arrow IPC files with the dataset schema. The
//! predict output uses the same schema, one row per input row, with the
//! predicted boxes as annotations.

use std::{
    collections::BTreeMap,
    ffi::OsStr,
    path::{Path, PathBuf},
    process::Command,
};

use crate::{
    Error,
    augment::BoundingBox,
    cleaner::recursive_copy,
    config::TrainerConfig,
    dataset::{Dataset, DatasetRecord, ImageTable, dataset_file},
    utils::{make_dir, write_json},
    visualize::draw_boxes,
};
use image::ImageFormat;
use log::{debug, info, warn};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

/// Evaluation metrics reported by a detector, e.g. `mean_average_precision_50`.
pub type Metrics = BTreeMap<String, f64>;

/// Confidence threshold used when visualizing predictions.
pub const VISUALIZE_CONFIDENCE: f64 = 0.2;

/// A trainable object detector.
pub trait Detector {
    /// Train on `train` for at most `max_iterations` iterations.
    fn train(&mut self, train: &Dataset, max_iterations: u32) -> Result<(), Error>;

    fn evaluate(&self, test: &Dataset) -> Result<Metrics, Error>;

    /// Predict boxes for every row of `images`, keeping those scoring at least
    /// `confidence_threshold`. The result has one row per input row.
    fn predict(&self, images: &Dataset, confidence_threshold: f64) -> Result<Dataset, Error>;

    /// Persist the trained model in its native format.
    fn save(&self, path: &Path) -> Result<(), Error>;

    /// Write a deployable model artifact.
    fn export(&self, path: &Path) -> Result<(), Error>;
}

/// Detector backed by an external trainer program.
#[derive(Debug, Clone)]
pub struct CommandDetector {
    config: TrainerConfig,
    work_dir: PathBuf,
    model: Option<PathBuf>,
}

impl CommandDetector {
    /// A detector that has not been trained yet. Intermediate files go to
    /// `work_dir`.
    pub fn new(config: TrainerConfig, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            work_dir: work_dir.into(),
            model: None,
        }
    }

    /// A detector using a previously saved model.
    pub fn load(
        config: TrainerConfig,
        model: &Path,
        work_dir: impl Into<PathBuf>,
    ) -> Result<Self, Error> {
        if !model.exists() {
            return Err(Error::InvalidParameters(format!("model {:?} does not exist", model)));
        }
        Ok(Self {
            config,
            work_dir: work_dir.into(),
            model: Some(model.to_path_buf()),
        })
    }

    fn trained_model(&self) -> Result<&Path, Error> {
        self.model
            .as_deref()
            .ok_or_else(|| Error::InvalidParameters("detector has not been trained".to_string()))
    }

    fn run<I, S>(&self, subcommand: &str, args: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.config.program);
        command.args(&self.config.args).arg(subcommand).args(args);
        debug!("running {:?}", command);

        let output = command.output().map_err(|e| {
            Error::TrainerFailed(format!("cannot start {:?}: {}", self.config.program, e))
        })?;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!("[{}] {}", subcommand, line);
        }
        if !output.status.success() {
            return Err(Error::TrainerFailed(format!(
                "{} exited with {}: {}",
                subcommand,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl Detector for CommandDetector {
    fn train(&mut self, train: &Dataset, max_iterations: u32) -> Result<(), Error> {
        std::fs::create_dir_all(&self.work_dir)?;
        let train_file = dataset_file(&self.work_dir, "train");
        train.save(&train_file)?;
        let model = self.work_dir.join("trained.model");
        let iterations = max_iterations.to_string();

        self.run(
            "train",
            [
                OsStr::new("--train"),
                train_file.as_os_str(),
                OsStr::new("--max-iterations"),
                OsStr::new(&iterations),
                OsStr::new("--model"),
                model.as_os_str(),
            ],
        )?;
        if !model.exists() {
            return Err(Error::TrainerFailed(format!("train did not write {:?}", model)));
        }
        self.model = Some(model);
        Ok(())
    }

    fn evaluate(&self, test: &Dataset) -> Result<Metrics, Error> {
        let model = self.trained_model()?;
        std::fs::create_dir_all(&self.work_dir)?;
        let test_file = dataset_file(&self.work_dir, "test");
        test.save(&test_file)?;
        let metrics = self.work_dir.join("evaluation.json");

        self.run(
            "evaluate",
            [
                OsStr::new("--model"),
                model.as_os_str(),
                OsStr::new("--test"),
                test_file.as_os_str(),
                OsStr::new("--metrics"),
                metrics.as_os_str(),
            ],
        )?;
        Ok(serde_json::from_str(&std::fs::read_to_string(&metrics)?)?)
    }

    fn predict(&self, images: &Dataset, confidence_threshold: f64) -> Result<Dataset, Error> {
        let model = self.trained_model()?;
        std::fs::create_dir_all(&self.work_dir)?;
        let input = dataset_file(&self.work_dir, "predict_input");
        let output = dataset_file(&self.work_dir, "predictions");
        images.save(&input)?;
        let confidence = confidence_threshold.to_string();

        self.run(
            "predict",
            [
                OsStr::new("--model"),
                model.as_os_str(),
                OsStr::new("--input"),
                input.as_os_str(),
                OsStr::new("--output"),
                output.as_os_str(),
                OsStr::new("--confidence"),
                OsStr::new(&confidence),
            ],
        )?;

        let predictions = Dataset::load(&output)?;
        if predictions.len() != images.len() {
            return Err(Error::TrainerFailed(format!(
                "predict returned {} rows for {} images",
                predictions.len(),
                images.len()
            )));
        }
        Ok(predictions)
    }

    fn save(&self, path: &Path) -> Result<(), Error> {
        let model = self.trained_model()?;
        if model == path {
            return Ok(());
        }
        if model.is_dir() {
            recursive_copy(model, path)?;
        } else {
            std::fs::copy(model, path)?;
        }
        Ok(())
    }

    fn export(&self, path: &Path) -> Result<(), Error> {
        let model = self.trained_model()?;
        self.run(
            "export",
            [
                OsStr::new("--model"),
                model.as_os_str(),
                OsStr::new("--output"),
                path.as_os_str(),
            ],
        )
    }
}

/// Files written by a training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub train_rows: usize,
    pub test_rows: usize,
    pub metrics: Metrics,
    pub metrics_path: PathBuf,
    pub model_path: PathBuf,
    pub export_path: PathBuf,
}

/// Splits a dataset, trains and evaluates a [`Detector`] and persists the
/// results.
pub struct TrainingDriver<D: Detector> {
    detector: D,
    train_test_split: f64,
    max_iterations: u32,
    model_name: String,
    rng: StdRng,
}

impl<D: Detector> TrainingDriver<D> {
    pub fn new(
        detector: D,
        train_test_split: f64,
        max_iterations: u32,
        model_name: impl Into<String>,
        seed: u64,
    ) -> Self {
        Self {
            detector,
            train_test_split,
            max_iterations,
            model_name: model_name.into(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    pub fn model_path(&self, model_dir: &Path) -> PathBuf {
        model_dir.join(format!("{}.model", self.model_name))
    }

    pub fn export_path(&self, model_dir: &Path) -> PathBuf {
        model_dir.join(format!("{}.mlmodel", self.model_name))
    }

    /// Train on the dataset at `dataset_path`, writing `metrics.json`,
    /// `<name>.model` and `<name>.mlmodel` into `model_dir`.
    pub fn train(
        &mut self,
        dataset_path: &Path,
        model_dir: &Path,
    ) -> Result<TrainingReport, Error> {
        let dataset = Dataset::load(dataset_path)?;
        let rows = dataset.len();
        let dataset = dataset.drop_missing_images();
        if dataset.len() < rows {
            warn!("ignoring {} rows without images", rows - dataset.len());
        }
        if dataset.is_empty() {
            return Err(Error::MissingImages(format!("{:?} has no rows with images", dataset_path)));
        }

        let (train, test) = dataset.random_split(self.train_test_split, &mut self.rng)?;
        info!(
            "training on {} rows, testing on {} rows, {} iterations",
            train.len(),
            test.len(),
            self.max_iterations
        );
        make_dir(model_dir)?;

        self.detector.train(&train, self.max_iterations)?;
        let metrics = self.detector.evaluate(&test)?;
        for (name, value) in &metrics {
            info!("\t{}: {}", name, value);
        }
        let metrics_path = write_json(&metrics, "metrics", model_dir)?;

        let model_path = self.model_path(model_dir);
        self.detector.save(&model_path)?;
        let export_path = self.export_path(model_dir);
        self.detector.export(&export_path)?;

        Ok(TrainingReport {
            train_rows: train.len(),
            test_rows: test.len(),
            metrics,
            metrics_path,
            model_path,
            export_path,
        })
    }
}

/// Predict on every image below `test_images_dir`, in seeded random order, and
/// write each image with its predicted boxes to `output_dir` as `<n>.JPEG`.
pub fn visualize_results<D: Detector>(
    detector: &D,
    test_images_dir: &Path,
    output_dir: &Path,
    seed: u64,
) -> Result<Vec<PathBuf>, Error> {
    let table = ImageTable::load(test_images_dir)?;
    if table.is_empty() {
        return Err(Error::MissingImages(format!("no images in {:?}", test_images_dir)));
    }
    let mut paths = table.paths();
    paths.shuffle(&mut StdRng::seed_from_u64(seed));

    let records = paths
        .into_iter()
        .map(|p| DatasetRecord::new(p, Vec::new()))
        .collect();
    let images = Dataset::new(records).left_join_images(&table);
    let predictions = detector.predict(&images, VISUALIZE_CONFIDENCE)?;

    std::fs::create_dir_all(output_dir)?;
    let mut written = Vec::new();
    for (n, (record, predicted)) in images.records().iter().zip(predictions.records()).enumerate() {
        let Some(image) = &record.image else {
            continue;
        };
        let boxes: Vec<BoundingBox> = predicted
            .annotations
            .iter()
            .map(BoundingBox::from_annotation)
            .collect();
        let path = output_dir.join(format!("{}.JPEG", n));
        draw_boxes(&image.decode()?, &boxes, 0).save_with_format(&path, ImageFormat::Jpeg)?;
        written.push(path);
    }
    info!("wrote {} predictions to {:?}", written.len(), output_dir);
    Ok(written)
}
