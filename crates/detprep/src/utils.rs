// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Small stateless helpers shared by the pipeline stages.

use crate::Error;
use log::debug;
use serde::Serialize;
use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
    sync::mpsc::Sender,
};

/// Progress information for long running stages.
///
/// Stages send one `Progress` per processed item through an optional channel;
/// consumers such as the CLI render it as a progress bar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Current number of completed items.
    pub current: usize,
    /// Total number of items to process.
    pub total: usize,
    /// Optional status message, e.g. the label directory being processed.
    pub status: Option<String>,
}

/// Send a progress update if a channel was provided.
///
/// A disconnected receiver is ignored; progress is purely observational.
pub(crate) fn send_progress(
    progress: &Option<Sender<Progress>>,
    current: usize,
    total: usize,
    status: Option<&str>,
) {
    if let Some(tx) = progress {
        let _ = tx.send(Progress {
            current,
            total,
            status: status.map(String::from),
        });
    }
}

/// Render a textual progress bar line.
///
/// ```
/// use detprep::utils::progress_line;
///
/// let line = progress_line(5, 10, "Progress:", "", 1, 10, '*');
/// assert_eq!(line, "Progress: |*****-----| 50.0% ");
/// ```
pub fn progress_line(
    iteration: usize,
    total: usize,
    prefix: &str,
    suffix: &str,
    decimals: usize,
    length: usize,
    fill: char,
) -> String {
    let (percent, filled) = if total == 0 {
        (100.0, length)
    } else {
        (
            100.0 * iteration as f64 / total as f64,
            (length * iteration / total).min(length),
        )
    };
    let bar: String = std::iter::repeat_n(fill, filled)
        .chain(std::iter::repeat_n('-', length - filled))
        .collect();
    format!("{} |{}| {:.*}% {}", prefix, bar, decimals, percent, suffix)
}

/// Center point between two coordinates.
pub fn calc_center(c_min: f64, c_max: f64) -> f64 {
    c_min + (c_max - c_min) / 2.0
}

/// Distance between two coordinates.
pub fn calc_dist(c_min: f64, c_max: f64) -> f64 {
    c_max - c_min
}

/// File stem used to pair annotations with images: the file name up to the
/// first `.`.
pub fn stem_of(file_name: &str) -> &str {
    file_name.split('.').next().unwrap_or(file_name)
}

/// Create a directory (and parents) if it does not exist yet.
///
/// Returns `true` when the directory was created by this call.
pub fn make_dir(dir_path: &Path) -> Result<bool, Error> {
    if dir_path.exists() {
        return Ok(false);
    }
    std::fs::create_dir_all(dir_path)?;
    debug!("created directory {:?}", dir_path);
    Ok(true)
}

/// Remove a directory's contents by recreating it empty.
pub fn reset_dir(dir_path: &Path) -> Result<(), Error> {
    if dir_path.exists() {
        std::fs::remove_dir_all(dir_path)?;
    }
    std::fs::create_dir_all(dir_path)?;
    Ok(())
}

/// Write serializable data as `<name>.json` into `output_dir`.
pub fn write_json<T: Serialize>(data: &T, name: &str, output_dir: &Path) -> Result<PathBuf, Error> {
    let path = output_dir.join(format!("{}.json", name));
    let writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(writer, data)?;
    Ok(path)
}
