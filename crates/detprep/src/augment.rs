// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Seeded image augmentation with joint bounding-box bookkeeping.
//!
//! An [`Augmentor`] owns an ordered list of [`Augmenter`]s and its own
//! [`StdRng`]. Each image runs through the augmenters in a freshly shuffled
//! order. Geometric augmenters move the boxes with the same transform they
//! apply to the pixels; photometric ones leave the boxes alone.
//!
//! Two augmentors built with the same seed produce identical output for the
//! same input sequence.

use std::{
    fmt::Display,
    path::{Path, PathBuf},
    sync::mpsc::Sender,
};

use crate::{
    Error,
    dataset::{
        Annotation, Coordinates, Dataset, DatasetRecord, ImageData, ImageTable, dataset_file,
        path_key,
    },
    utils::{Progress, send_progress},
};
use image::{ImageFormat, Rgb, RgbImage, imageops};
use imageproc::geometric_transformations::{Interpolation, Projection, warp};
use log::{debug, info};
use nalgebra::{Matrix3, Vector3};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use rand_distr::{Distribution, Normal};

/// Seed of the default pipeline.
pub const DEFAULT_SEED: u64 = 1;

/// Bounding box in corner form, in pixel coordinates of the image it belongs
/// to.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    pub label: String,
}

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64, label: impl Into<String>) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            label: label.into(),
        }
    }

    pub fn from_annotation(annotation: &Annotation) -> Self {
        let [x1, y1, x2, y2] = annotation.coordinates.corners();
        Self::new(x1, y1, x2, y2, annotation.label.clone())
    }

    pub fn to_annotation(&self) -> Annotation {
        Annotation::new(
            self.label.clone(),
            Coordinates::from_corners(self.x1, self.y1, self.x2, self.y2),
        )
    }

    pub fn shift(&self, dx: f64, dy: f64) -> Self {
        Self::new(self.x1 + dx, self.y1 + dy, self.x2 + dx, self.y2 + dy, self.label.clone())
    }

    /// True when the box lies entirely inside a `width` x `height` frame.
    pub fn is_fully_within(&self, width: u32, height: u32) -> bool {
        self.x1 >= 0.0 && self.y1 >= 0.0 && self.x2 <= width as f64 && self.y2 <= height as f64
    }

    /// True when the box does not overlap the frame at all.
    pub fn is_out_of_image(&self, width: u32, height: u32) -> bool {
        self.x2 <= 0.0 || self.y2 <= 0.0 || self.x1 >= width as f64 || self.y1 >= height as f64
    }

    /// True when the box overlaps the frame without lying fully inside it.
    pub fn is_partly_within(&self, width: u32, height: u32) -> bool {
        !self.is_out_of_image(width, height) && !self.is_fully_within(width, height)
    }

    /// Clamp the corners to the frame.
    pub fn clip(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f64, height as f64);
        Self::new(
            self.x1.clamp(0.0, w),
            self.y1.clamp(0.0, h),
            self.x2.clamp(0.0, w),
            self.y2.clamp(0.0, h),
            self.label.clone(),
        )
    }

    /// Map the four corners through `transform` and take their bounds.
    fn transform(&self, transform: &Matrix3<f64>) -> Self {
        let corners = [
            (self.x1, self.y1),
            (self.x2, self.y1),
            (self.x1, self.y2),
            (self.x2, self.y2),
        ];
        let mut x1 = f64::INFINITY;
        let mut y1 = f64::INFINITY;
        let mut x2 = f64::NEG_INFINITY;
        let mut y2 = f64::NEG_INFINITY;
        for (x, y) in corners {
            let p = transform * Vector3::new(x, y, 1.0);
            let (px, py) = (p.x / p.z, p.y / p.z);
            x1 = x1.min(px);
            y1 = y1.min(py);
            x2 = x2.max(px);
            y2 = y2.max(py);
        }
        Self::new(x1, y1, x2, y2, self.label.clone())
    }
}

/// Drop boxes outside the frame and clip the rest to it.
pub fn remove_and_clip(boxes: &[BoundingBox], width: u32, height: u32) -> Vec<BoundingBox> {
    boxes
        .iter()
        .filter(|b| !b.is_out_of_image(width, height))
        .map(|b| b.clip(width, height))
        .collect()
}

/// Parameter ranges of [`Augmenter::Affine`].
#[derive(Debug, Clone, PartialEq)]
pub struct AffineParams {
    /// Scale factor range, per axis.
    pub scale: (f64, f64),
    /// Translation range as a fraction of the image size, per axis.
    pub translate_percent: (f64, f64),
    /// Rotation range in degrees.
    pub rotate: (f64, f64),
    /// Shear range in degrees.
    pub shear: (f64, f64),
}

impl Default for AffineParams {
    fn default() -> Self {
        Self {
            scale: (0.8, 1.2),
            translate_percent: (-0.2, 0.2),
            rotate: (-25.0, 25.0),
            shear: (-8.0, 8.0),
        }
    }
}

/// A single augmentation step.
#[derive(Debug, Clone, PartialEq)]
pub enum Augmenter {
    /// Mirror horizontally with probability `p`.
    Fliplr { p: f64 },
    /// Crop each side by a fraction in `percent`, then resize back.
    Crop { percent: (f64, f64) },
    /// Apply `then` with probability `p`.
    Sometimes { p: f64, then: Box<Augmenter> },
    /// Gaussian blur with sigma drawn from `sigma`.
    GaussianBlur { sigma: (f32, f32) },
    /// Scale contrast around 128 by a factor drawn from `alpha`.
    ContrastNormalization { alpha: (f32, f32) },
    /// Add zero-mean Gaussian noise. With probability `per_channel` the
    /// noise is sampled per channel instead of per pixel.
    AdditiveGaussianNoise { scale: (f32, f32), per_channel: f64 },
    /// Multiply pixel values. With probability `per_channel` one factor is
    /// drawn per channel.
    Multiply { mul: (f32, f32), per_channel: f64 },
    /// Random affine transform around the image center.
    Affine(AffineParams),
}

impl Display for Augmenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Augmenter::Fliplr { .. } => write!(f, "Fliplr"),
            Augmenter::Crop { .. } => write!(f, "Crop"),
            Augmenter::Sometimes { then, .. } => write!(f, "Sometimes({})", then),
            Augmenter::GaussianBlur { .. } => write!(f, "GaussianBlur"),
            Augmenter::ContrastNormalization { .. } => write!(f, "ContrastNormalization"),
            Augmenter::AdditiveGaussianNoise { .. } => write!(f, "AdditiveGaussianNoise"),
            Augmenter::Multiply { .. } => write!(f, "Multiply"),
            Augmenter::Affine(_) => write!(f, "Affine"),
        }
    }
}

fn sample_f64(rng: &mut StdRng, (lo, hi): (f64, f64)) -> f64 {
    if lo < hi { rng.gen_range(lo..=hi) } else { lo }
}

fn sample_f32(rng: &mut StdRng, (lo, hi): (f32, f32)) -> f32 {
    if lo < hi { rng.gen_range(lo..=hi) } else { lo }
}

fn to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

impl Augmenter {
    /// The light augmentation sequence used for training data.
    pub fn default_sequence() -> Vec<Augmenter> {
        vec![
            Augmenter::Fliplr { p: 0.5 },
            Augmenter::Crop { percent: (0.0, 0.1) },
            Augmenter::Sometimes {
                p: 0.5,
                then: Box::new(Augmenter::GaussianBlur { sigma: (0.0, 0.5) }),
            },
            Augmenter::ContrastNormalization { alpha: (0.75, 1.5) },
            Augmenter::AdditiveGaussianNoise {
                scale: (0.0, 0.05 * 255.0),
                per_channel: 0.5,
            },
            Augmenter::Multiply {
                mul: (0.8, 1.2),
                per_channel: 0.2,
            },
            Augmenter::Affine(AffineParams::default()),
        ]
    }

    /// Apply to `image`, moving `boxes` along with geometric changes.
    pub fn apply(
        &self,
        image: RgbImage,
        boxes: &mut [BoundingBox],
        rng: &mut StdRng,
    ) -> Result<RgbImage, Error> {
        let (width, height) = image.dimensions();
        match self {
            Augmenter::Fliplr { p } => {
                if !rng.gen_bool(*p) {
                    return Ok(image);
                }
                let w = width as f64;
                for b in boxes.iter_mut() {
                    let (x1, x2) = (w - b.x2, w - b.x1);
                    b.x1 = x1;
                    b.x2 = x2;
                }
                Ok(imageops::flip_horizontal(&image))
            }
            Augmenter::Crop { percent } => {
                let mut side =
                    |extent: u32| (sample_f64(rng, *percent) * extent as f64).round() as u32;
                let (top, right, bottom, left) =
                    (side(height), side(width), side(height), side(width));
                let crop_w = width.saturating_sub(left + right).max(1);
                let crop_h = height.saturating_sub(top + bottom).max(1);
                let left = left.min(width - crop_w);
                let top = top.min(height - crop_h);
                if crop_w == width && crop_h == height {
                    return Ok(image);
                }

                let cropped = imageops::crop_imm(&image, left, top, crop_w, crop_h).to_image();
                let resized =
                    imageops::resize(&cropped, width, height, imageops::FilterType::Triangle);

                let sx = width as f64 / crop_w as f64;
                let sy = height as f64 / crop_h as f64;
                for b in boxes.iter_mut() {
                    b.x1 = (b.x1 - left as f64) * sx;
                    b.x2 = (b.x2 - left as f64) * sx;
                    b.y1 = (b.y1 - top as f64) * sy;
                    b.y2 = (b.y2 - top as f64) * sy;
                }
                Ok(resized)
            }
            Augmenter::Sometimes { p, then } => {
                if rng.gen_bool(*p) {
                    then.apply(image, boxes, rng)
                } else {
                    Ok(image)
                }
            }
            Augmenter::GaussianBlur { sigma } => {
                let sigma = sample_f32(rng, *sigma);
                // too small to change any pixel
                if sigma < 0.01 {
                    return Ok(image);
                }
                Ok(imageproc::filter::gaussian_blur_f32(&image, sigma))
            }
            Augmenter::ContrastNormalization { alpha } => {
                let alpha = sample_f32(rng, *alpha);
                let mut image = image;
                for pixel in image.pixels_mut() {
                    for c in pixel.0.iter_mut() {
                        *c = to_u8(128.0 + alpha * (*c as f32 - 128.0));
                    }
                }
                Ok(image)
            }
            Augmenter::AdditiveGaussianNoise { scale, per_channel } => {
                let sigma = sample_f32(rng, *scale);
                let per_channel = rng.gen_bool(*per_channel);
                if sigma <= 0.0 {
                    return Ok(image);
                }
                let normal = Normal::new(0.0f32, sigma).map_err(|e| {
                    Error::InvalidParameters(format!("noise scale {}: {}", sigma, e))
                })?;
                let mut image = image;
                for pixel in image.pixels_mut() {
                    if per_channel {
                        for c in pixel.0.iter_mut() {
                            *c = to_u8(*c as f32 + normal.sample(rng));
                        }
                    } else {
                        let noise = normal.sample(rng);
                        for c in pixel.0.iter_mut() {
                            *c = to_u8(*c as f32 + noise);
                        }
                    }
                }
                Ok(image)
            }
            Augmenter::Multiply { mul, per_channel } => {
                let factors = if rng.gen_bool(*per_channel) {
                    [sample_f32(rng, *mul), sample_f32(rng, *mul), sample_f32(rng, *mul)]
                } else {
                    [sample_f32(rng, *mul); 3]
                };
                let mut image = image;
                for pixel in image.pixels_mut() {
                    for (c, factor) in pixel.0.iter_mut().zip(factors) {
                        *c = to_u8(*c as f32 * factor);
                    }
                }
                Ok(image)
            }
            Augmenter::Affine(params) => {
                let transform = affine_matrix(params, width, height, rng);
                let projection = projection_of(&transform)?;
                for b in boxes.iter_mut() {
                    *b = b.transform(&transform);
                }
                Ok(warp(&image, &projection, Interpolation::Bilinear, Rgb([0, 0, 0])))
            }
        }
    }
}

/// Sample an affine transform that scales, shears, rotates and translates
/// around the image center.
fn affine_matrix(params: &AffineParams, width: u32, height: u32, rng: &mut StdRng) -> Matrix3<f64> {
    let scale_x = sample_f64(rng, params.scale);
    let scale_y = sample_f64(rng, params.scale);
    let translate_x = sample_f64(rng, params.translate_percent) * width as f64;
    let translate_y = sample_f64(rng, params.translate_percent) * height as f64;
    let rotate = sample_f64(rng, params.rotate).to_radians();
    let shear = sample_f64(rng, params.shear).to_radians();

    let (cx, cy) = (width as f64 / 2.0, height as f64 / 2.0);
    let (sin, cos) = rotate.sin_cos();

    #[rustfmt::skip]
    let to_origin = Matrix3::new(
        1.0, 0.0, -cx,
        0.0, 1.0, -cy,
        0.0, 0.0, 1.0,
    );
    #[rustfmt::skip]
    let scaling = Matrix3::new(
        scale_x, 0.0, 0.0,
        0.0, scale_y, 0.0,
        0.0, 0.0, 1.0,
    );
    #[rustfmt::skip]
    let shearing = Matrix3::new(
        1.0, shear.tan(), 0.0,
        0.0, 1.0, 0.0,
        0.0, 0.0, 1.0,
    );
    #[rustfmt::skip]
    let rotation = Matrix3::new(
        cos, -sin, 0.0,
        sin, cos, 0.0,
        0.0, 0.0, 1.0,
    );
    #[rustfmt::skip]
    let back = Matrix3::new(
        1.0, 0.0, cx + translate_x,
        0.0, 1.0, cy + translate_y,
        0.0, 0.0, 1.0,
    );

    back * rotation * shearing * scaling * to_origin
}

fn projection_of(transform: &Matrix3<f64>) -> Result<Projection, Error> {
    let mut matrix = [0f32; 9];
    for row in 0..3 {
        for col in 0..3 {
            matrix[row * 3 + col] = transform[(row, col)] as f32;
        }
    }
    Projection::from_matrix(matrix).ok_or_else(|| {
        Error::InvalidParameters(format!("affine transform is not invertible: {}", transform))
    })
}

/// Seeded augmentation pipeline applied in random order.
#[derive(Debug, Clone)]
pub struct Augmentor {
    augmenters: Vec<Augmenter>,
    rng: StdRng,
}

impl Default for Augmentor {
    fn default() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }
}

impl Augmentor {
    /// The default sequence with the given seed.
    pub fn with_seed(seed: u64) -> Self {
        Self::new(Augmenter::default_sequence(), seed)
    }

    pub fn new(augmenters: Vec<Augmenter>, seed: u64) -> Self {
        Self {
            augmenters,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Run the pipeline over one image and its boxes.
    ///
    /// Returned boxes are not clipped; see [`remove_and_clip`].
    pub fn augment(
        &mut self,
        image: RgbImage,
        mut boxes: Vec<BoundingBox>,
    ) -> Result<(RgbImage, Vec<BoundingBox>), Error> {
        let mut order: Vec<usize> = (0..self.augmenters.len()).collect();
        order.shuffle(&mut self.rng);

        let mut image = image;
        for idx in order {
            let augmenter = &self.augmenters[idx];
            image = augmenter.apply(image, &mut boxes, &mut self.rng)?;
        }
        Ok((image, boxes))
    }

    /// Augment every record of `dataset` in order, writing `<n>.JPEG` into
    /// `output_dir`.
    ///
    /// The returned dataset has one row per input row, joined with the images
    /// read back from `output_dir`.
    pub fn augment_dataset(
        &mut self,
        dataset: &Dataset,
        output_dir: &Path,
        progress: Option<Sender<Progress>>,
    ) -> Result<Dataset, Error> {
        std::fs::create_dir_all(output_dir)?;
        let total = dataset.len();
        send_progress(&progress, 0, total, None);

        let mut records = Vec::with_capacity(total);
        for (count, record) in dataset.records().iter().enumerate() {
            let image = source_image(record)?;
            let boxes = record.annotations.iter().map(BoundingBox::from_annotation).collect();
            let (augmented, boxes) = self.augment(image, boxes)?;

            let path = augmented_path(output_dir, count);
            augmented.save_with_format(&path, ImageFormat::Jpeg)?;

            let (width, height) = augmented.dimensions();
            let annotations: Vec<Annotation> = remove_and_clip(&boxes, width, height)
                .iter()
                .map(BoundingBox::to_annotation)
                .collect();
            debug!(
                "{} -> {:?}: {} of {} boxes kept",
                record.path,
                path,
                annotations.len(),
                record.annotations.len()
            );

            records.push(DatasetRecord::new(path_key(&path), annotations));
            send_progress(&progress, count + 1, total, None);
        }

        let images = ImageTable::load(output_dir)?;
        Ok(Dataset::new(records).left_join_images(&images))
    }
}

/// Path of the `n`-th augmented image.
pub fn augmented_path(output_dir: &Path, n: usize) -> PathBuf {
    output_dir.join(format!("{}.JPEG", n))
}

/// Decode the record's joined image, or read it from `path`.
fn source_image(record: &DatasetRecord) -> Result<RgbImage, Error> {
    if let Some(image) = &record.image {
        return image.decode();
    }
    ImageData::open(Path::new(&record.path))
        .and_then(|image| image.decode())
        .map_err(|err| Error::MissingImages(format!("{}: {}", record.path, err)))
}

/// Augment `original.arrow` from `dataset_dir`, writing images into
/// `output_dir` and `augmented.arrow` plus `final.arrow` (original followed by
/// augmented rows) next to the original.
///
/// Returns `(augmented, final)`.
pub fn augment_data(
    dataset_dir: &Path,
    output_dir: &Path,
    augmentor: &mut Augmentor,
    progress: Option<Sender<Progress>>,
) -> Result<(Dataset, Dataset), Error> {
    let original = Dataset::load(&dataset_file(dataset_dir, "original"))?;
    let augmented = augmentor.augment_dataset(&original, output_dir, progress)?;

    let mut combined = original;
    combined.append(augmented.clone());

    augmented.save(&dataset_file(dataset_dir, "augmented"))?;
    combined.save(&dataset_file(dataset_dir, "final"))?;
    info!("augmented dataset: {}", augmented);
    info!("final dataset: {}", combined);
    Ok((augmented, combined))
}
