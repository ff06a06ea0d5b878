// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! # detprep
//!
//! Dataset preparation and training pipeline for object detection models.
//!
//! Starting from an annotation tree and an image tree, each with one
//! sub-directory per label, the pipeline:
//!
//! 1. **cleans** the trees so every `.xml` annotation has an image and vice
//!    versa, and stages the images into a single directory
//! 2. **converts** the XML bounding boxes into center-form annotations and
//!    stores them with their images as an Arrow IPC dataset
//! 3. **augments** every image with a seeded random pipeline, keeping the
//!    boxes in step with the pixels
//! 4. **trains** a detector behind the [`Detector`] trait, evaluates it on a
//!    held-out split and exports the model
//!
//! Progress of each stage is recorded in a manifest so reruns skip stages
//! whose inputs have not changed.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use detprep::{Error, PipelineConfig, PipelineRunner};
//!
//! fn main() -> Result<(), Error> {
//!     let config = PipelineConfig::load(None)?;
//!     let mut runner = PipelineRunner::new(config)?;
//!     for outcome in runner.run()? {
//!         println!("{}: {:?}", outcome.stage, outcome.status);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Playground Layout
//!
//! - `allImages/`: cleaned images of every label
//! - `dataset/original.arrow`, `dataset/augmented.arrow`,
//!   `dataset/final.arrow`
//! - `allAugmentedImages/<n>.JPEG`
//! - `model/<name>.model`, `model/<name>.mlmodel`, `model/metrics.json`
//! - `manifest.json`

pub mod annotations;
pub mod augment;
pub mod cleaner;
pub mod config;
pub mod dataset;
mod error;
pub mod manifest;
pub mod pipeline;
pub mod training;
pub mod utils;
pub mod visualize;

pub use crate::{
    annotations::{AnnotationConverter, BoundingCorners, transform_bounding},
    augment::{Augmenter, Augmentor, BoundingBox},
    cleaner::{CleaningReport, DataCleaner, clean_data},
    config::{ConfigOverrides, PipelineConfig, TrainerConfig},
    dataset::{Annotation, Coordinates, Dataset, DatasetRecord, ImageData, ImageTable},
    error::Error,
    manifest::{Manifest, Stage, StageRecord},
    pipeline::{PipelineRunner, StageOutcome, StageStatus},
    training::{
        CommandDetector, Detector, Metrics, TrainingDriver, TrainingReport, visualize_results,
    },
    utils::Progress,
};
