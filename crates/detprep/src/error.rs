// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

/// Error type for the detprep pipeline.
///
/// Wraps the errors of the libraries the pipeline delegates to (filesystem,
/// configuration, polars, image codecs, XML) alongside the pipeline's own
/// validation failures.
#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred during file operations.
    IoError(std::io::Error),
    /// Configuration parsing or loading error.
    ConfigError(config::ConfigError),
    /// JSON serialization or deserialization error.
    JsonError(serde_json::Error),
    /// Polars dataframe operation error.
    PolarsError(polars::error::PolarsError),
    /// Image decoding or encoding error.
    ImageError(image::ImageError),
    /// XML annotation parsing error.
    XmlError(xml::reader::Error),
    /// Directory traversal error.
    WalkDirError(walkdir::Error),
    /// Path prefix stripping error.
    StripPrefixError(std::path::StripPrefixError),
    /// Annotation file is malformed, e.g. the bounding box coordinate lists
    /// have different lengths.
    AnnotationFormat(String),
    /// Annotation and image stems still differ after cleaning.
    DataValidation(String),
    /// Required image files are missing from the dataset.
    MissingImages(String),
    /// Invalid parameters provided to an operation.
    InvalidParameters(String),
    /// The external trainer exited unsuccessfully.
    TrainerFailed(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::ConfigError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::JsonError(err)
    }
}

impl From<polars::error::PolarsError> for Error {
    fn from(err: polars::error::PolarsError) -> Self {
        Error::PolarsError(err)
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::ImageError(err)
    }
}

impl From<xml::reader::Error> for Error {
    fn from(err: xml::reader::Error) -> Self {
        Error::XmlError(err)
    }
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        Error::WalkDirError(err)
    }
}

impl From<std::path::StripPrefixError> for Error {
    fn from(err: std::path::StripPrefixError) -> Self {
        Error::StripPrefixError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(e) => write!(f, "I/O error: {}", e),
            Error::ConfigError(e) => write!(f, "Configuration error: {}", e),
            Error::JsonError(e) => write!(f, "JSON error: {}", e),
            Error::PolarsError(e) => write!(f, "Polars error: {}", e),
            Error::ImageError(e) => write!(f, "Image error: {}", e),
            Error::XmlError(e) => write!(f, "XML error: {}", e),
            Error::WalkDirError(e) => write!(f, "Directory traversal error: {}", e),
            Error::StripPrefixError(e) => write!(f, "Path prefix error: {}", e),
            Error::AnnotationFormat(s) => write!(f, "Malformed annotation: {}", s),
            Error::DataValidation(s) => write!(f, "Data is still not valid: {}", s),
            Error::MissingImages(s) => write!(f, "Missing images: {}", s),
            Error::InvalidParameters(s) => write!(f, "Invalid parameters: {}", s),
            Error::TrainerFailed(s) => write!(f, "Trainer failed: {}", s),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(e) => Some(e),
            Error::ConfigError(e) => Some(e),
            Error::JsonError(e) => Some(e),
            Error::PolarsError(e) => Some(e),
            Error::ImageError(e) => Some(e),
            Error::XmlError(e) => Some(e),
            Error::WalkDirError(e) => Some(e),
            Error::StripPrefixError(e) => Some(e),
            _ => None,
        }
    }
}
