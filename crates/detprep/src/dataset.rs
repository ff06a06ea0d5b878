// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Dataset records and their tabular (Arrow IPC) representation.
//!
//! A [`Dataset`] is an ordered list of [`DatasetRecord`]s, one per image. Each
//! record carries the image path, its bounding-box annotations in center form
//! and, once joined against an [`ImageTable`], the encoded image itself.
//!
//! # Schema
//!
//! - `path`: Image path (String)
//! - `annotations`: List<Struct{label: String, coordinates: Struct{x, y,
//!   width, height: Float64}}>
//! - `image`: Encoded image bytes (Binary, null when no image was joined)
//! - `width`, `height`, `channels`: Image geometry (UInt32, null with `image`)

use std::{
    collections::HashMap,
    fmt::Display,
    fs::File,
    io::Cursor,
    path::{Path, PathBuf},
};

use crate::{
    Error,
    utils::{calc_center, calc_dist},
};
use image::{ImageDecoder, ImageReader, RgbImage};
use log::{debug, warn};
use polars::prelude::*;
use rand::{rngs::StdRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// Image file extensions loaded into an [`ImageTable`].
pub const IMAGE_EXTENSIONS: &[&str] = &["jpeg", "jpg", "png"];

/// Bounding box in center form.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Coordinates {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Coordinates {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build center-form coordinates from box corners.
    pub fn from_corners(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Self {
        Self {
            x: calc_center(x_min, x_max),
            y: calc_center(y_min, y_max),
            width: calc_dist(x_min, x_max),
            height: calc_dist(y_min, y_max),
        }
    }

    pub fn left(&self) -> f64 {
        self.x - self.width / 2.0
    }

    pub fn top(&self) -> f64 {
        self.y - self.height / 2.0
    }

    pub fn right(&self) -> f64 {
        self.x + self.width / 2.0
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height / 2.0
    }

    /// Corners as `[x_min, y_min, x_max, y_max]`.
    pub fn corners(&self) -> [f64; 4] {
        [self.left(), self.top(), self.right(), self.bottom()]
    }
}

/// A labelled bounding box.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Annotation {
    pub label: String,
    pub coordinates: Coordinates,
}

impl Annotation {
    pub fn new(label: impl Into<String>, coordinates: Coordinates) -> Self {
        Self {
            label: label.into(),
            coordinates,
        }
    }
}

/// An encoded image together with its geometry.
///
/// The bytes are kept encoded and decoded on demand, like the image column of
/// the persisted dataset.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageData {
    bytes: Vec<u8>,
    width: u32,
    height: u32,
    channels: u32,
}

impl ImageData {
    /// Wrap encoded image bytes, reading the geometry from the image header.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, Error> {
        let (width, height, channels) = {
            let decoder = ImageReader::new(Cursor::new(&bytes))
                .with_guessed_format()?
                .into_decoder()?;
            let (width, height) = decoder.dimensions();
            (width, height, decoder.color_type().channel_count() as u32)
        };
        Ok(Self {
            bytes,
            width,
            height,
            channels,
        })
    }

    /// Read and wrap the image file at `path`.
    pub fn open(path: &Path) -> Result<Self, Error> {
        Self::from_bytes(std::fs::read(path)?)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    /// Decode into an 8-bit RGB pixel buffer.
    pub fn decode(&self) -> Result<RgbImage, Error> {
        Ok(image::load_from_memory(&self.bytes)?.to_rgb8())
    }
}

/// One row of the dataset: an image path, its annotations and the joined
/// image.
#[derive(Clone, Debug, PartialEq)]
pub struct DatasetRecord {
    pub path: String,
    pub annotations: Vec<Annotation>,
    pub image: Option<ImageData>,
}

impl DatasetRecord {
    pub fn new(path: impl Into<String>, annotations: Vec<Annotation>) -> Self {
        Self {
            path: path.into(),
            annotations,
            image: None,
        }
    }
}

/// Decoded-image table keyed by exact path string.
#[derive(Clone, Debug, Default)]
pub struct ImageTable {
    images: HashMap<String, ImageData>,
}

impl ImageTable {
    /// Load every image below `dir`.
    ///
    /// Keys are `dir` joined with the file's relative path, so they match
    /// paths built from the same `dir` string. Files that fail to decode are
    /// skipped with a warning.
    pub fn load(dir: &Path) -> Result<Self, Error> {
        let mut images = HashMap::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() || !is_image_file(entry.path()) {
                continue;
            }
            match ImageData::open(entry.path()) {
                Ok(image) => {
                    images.insert(path_key(entry.path()), image);
                }
                Err(err) => warn!("skipping unreadable image {:?}: {}", entry.path(), err),
            }
        }
        debug!("loaded {} images from {:?}", images.len(), dir);
        Ok(Self { images })
    }

    /// Paths of all loaded images, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.images.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn get(&self, path: &str) -> Option<&ImageData> {
        self.images.get(path)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Returns true if the file extension is one of [`IMAGE_EXTENSIONS`]
/// (case-insensitive).
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// String key used to join records against images.
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Ordered collection of dataset records.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Dataset {
    records: Vec<DatasetRecord>,
}

impl Display for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let with_images = self.records.iter().filter(|r| r.image.is_some()).count();
        let boxes: usize = self.records.iter().map(|r| r.annotations.len()).sum();
        write!(
            f,
            "{} rows ({} with images, {} boxes)",
            self.records.len(),
            with_images,
            boxes
        )
    }
}

impl Dataset {
    pub fn new(records: Vec<DatasetRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[DatasetRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Left join on `path`: every record keeps its position and receives the
    /// matching image, or `None` when the table has no such path.
    pub fn left_join_images(self, images: &ImageTable) -> Self {
        let records = self
            .records
            .into_iter()
            .map(|mut record| {
                record.image = images.get(&record.path).cloned();
                record
            })
            .collect();
        Self { records }
    }

    /// Append all rows of `other` after the rows of `self`.
    pub fn append(&mut self, other: Dataset) {
        self.records.extend(other.records);
    }

    /// The first `n` rows.
    pub fn head(&self, n: usize) -> Dataset {
        Self {
            records: self.records.iter().take(n).cloned().collect(),
        }
    }

    /// Drop rows without a joined image.
    pub fn drop_missing_images(self) -> Self {
        Self {
            records: self
                .records
                .into_iter()
                .filter(|r| r.image.is_some())
                .collect(),
        }
    }

    /// Randomly partition the rows into `(train, test)` with `fraction` of the
    /// rows in the first partition.
    pub fn random_split(
        &self,
        fraction: f64,
        rng: &mut StdRng,
    ) -> Result<(Dataset, Dataset), Error> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(Error::InvalidParameters(format!(
                "split fraction must be between 0.0 and 1.0, got {}",
                fraction
            )));
        }
        let mut records = self.records.clone();
        records.shuffle(rng);
        let train_len = (records.len() as f64 * fraction).round() as usize;
        let test = records.split_off(train_len);
        Ok((Dataset::new(records), Dataset::new(test)))
    }

    /// Convert into a polars DataFrame following the dataset schema.
    pub fn to_dataframe(&self) -> Result<DataFrame, Error> {
        let paths: Vec<&str> = self.records.iter().map(|r| r.path.as_str()).collect();

        let annotations = if self.records.is_empty() {
            Series::new_empty(
                "annotations".into(),
                &DataType::List(Box::new(annotation_dtype())),
            )
        } else {
            let lists = self
                .records
                .iter()
                .map(|r| annotations_to_series(&r.annotations))
                .collect::<Result<Vec<_>, _>>()?;
            Series::new("annotations".into(), lists)
        };

        let images: Vec<Option<&[u8]>> = self
            .records
            .iter()
            .map(|r| r.image.as_ref().map(|i| i.bytes.as_slice()))
            .collect();
        let widths: Vec<Option<u32>> = self
            .records
            .iter()
            .map(|r| r.image.as_ref().map(|i| i.width))
            .collect();
        let heights: Vec<Option<u32>> = self
            .records
            .iter()
            .map(|r| r.image.as_ref().map(|i| i.height))
            .collect();
        let channels: Vec<Option<u32>> = self
            .records
            .iter()
            .map(|r| r.image.as_ref().map(|i| i.channels))
            .collect();

        Ok(DataFrame::new(vec![
            Series::new("path".into(), paths).into(),
            annotations.into(),
            Series::new("image".into(), images).into(),
            Series::new("width".into(), widths).into(),
            Series::new("height".into(), heights).into(),
            Series::new("channels".into(), channels).into(),
        ])?)
    }

    /// Rebuild a dataset from a DataFrame following the dataset schema.
    pub fn from_dataframe(df: &DataFrame) -> Result<Self, Error> {
        let paths = df.column("path")?.str()?;
        let annotations = df.column("annotations")?.list()?;
        let images = df.column("image")?.binary()?;
        let widths = df.column("width")?.u32()?;
        let heights = df.column("height")?.u32()?;
        let channels = df.column("channels")?.u32()?;

        let mut records = Vec::with_capacity(df.height());
        for idx in 0..df.height() {
            let path = paths
                .get(idx)
                .ok_or_else(|| Error::InvalidParameters(format!("row {} has no path", idx)))?;
            let annotations = match annotations.get_as_series(idx) {
                Some(series) => annotations_from_series(&series)?,
                None => Vec::new(),
            };
            let image = match (
                images.get(idx),
                widths.get(idx),
                heights.get(idx),
                channels.get(idx),
            ) {
                (Some(bytes), Some(width), Some(height), Some(channels)) => Some(ImageData {
                    bytes: bytes.to_vec(),
                    width,
                    height,
                    channels,
                }),
                _ => None,
            };
            records.push(DatasetRecord {
                path: path.to_string(),
                annotations,
                image,
            });
        }
        Ok(Self { records })
    }

    /// Write the dataset as an Arrow IPC file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut df = self.to_dataframe()?;
        let mut file = File::create(path)?;
        IpcWriter::new(&mut file).finish(&mut df)?;
        debug!("saved {} rows to {:?}", self.len(), path);
        Ok(())
    }

    /// Read a dataset written by [`Dataset::save`].
    pub fn load(path: &Path) -> Result<Self, Error> {
        let mut file = File::open(path).map_err(|e| {
            Error::InvalidParameters(format!("Cannot open dataset {:?}: {}", path, e))
        })?;
        let df = IpcReader::new(&mut file).finish()?;
        Self::from_dataframe(&df)
    }

    /// Summary table without the image bytes, for display.
    pub fn summary_dataframe(&self) -> Result<DataFrame, Error> {
        Ok(self.to_dataframe()?.drop("image")?)
    }
}

/// Dataset file path inside a dataset directory, e.g. `dataset/final.arrow`.
pub fn dataset_file(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.arrow", name))
}

fn coordinates_dtype() -> DataType {
    DataType::Struct(vec![
        Field::new("x".into(), DataType::Float64),
        Field::new("y".into(), DataType::Float64),
        Field::new("width".into(), DataType::Float64),
        Field::new("height".into(), DataType::Float64),
    ])
}

fn annotation_dtype() -> DataType {
    DataType::Struct(vec![
        Field::new("label".into(), DataType::String),
        Field::new("coordinates".into(), coordinates_dtype()),
    ])
}

fn annotations_to_series(annotations: &[Annotation]) -> Result<Series, Error> {
    let column = |name: &str, value: fn(&Coordinates) -> f64| -> Column {
        Series::new(
            name.into(),
            annotations
                .iter()
                .map(|a| value(&a.coordinates))
                .collect::<Vec<_>>(),
        )
        .into()
    };
    let coordinates = DataFrame::new(vec![
        column("x", |c| c.x),
        column("y", |c| c.y),
        column("width", |c| c.width),
        column("height", |c| c.height),
    ])?
    .into_struct("coordinates".into())
    .into_series();
    let labels = Series::new(
        "label".into(),
        annotations
            .iter()
            .map(|a| a.label.as_str())
            .collect::<Vec<_>>(),
    );

    Ok(DataFrame::new(vec![labels.into(), coordinates.into()])?
        .into_struct("annotations".into())
        .into_series())
}

fn annotations_from_series(series: &Series) -> Result<Vec<Annotation>, Error> {
    if series.is_empty() {
        return Ok(Vec::new());
    }
    let annotations = series.struct_()?;
    let labels = annotations.field_by_name("label")?;
    let labels = labels.str()?;
    let coordinates = annotations.field_by_name("coordinates")?;
    let coordinates = coordinates.struct_()?;
    let xs = coordinates.field_by_name("x")?;
    let ys = coordinates.field_by_name("y")?;
    let widths = coordinates.field_by_name("width")?;
    let heights = coordinates.field_by_name("height")?;
    let (xs, ys, widths, heights) = (xs.f64()?, ys.f64()?, widths.f64()?, heights.f64()?);

    (0..series.len())
        .map(|idx| {
            match (
                labels.get(idx),
                xs.get(idx),
                ys.get(idx),
                widths.get(idx),
                heights.get(idx),
            ) {
                (Some(label), Some(x), Some(y), Some(width), Some(height)) => Ok(Annotation::new(
                    label,
                    Coordinates::new(x, y, width, height),
                )),
                _ => Err(Error::InvalidParameters(format!(
                    "annotation {} has null fields",
                    idx
                ))),
            }
        })
        .collect()
}
