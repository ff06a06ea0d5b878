// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Reconciliation of annotation and image directories.
//!
//! Both input trees hold one subdirectory per label. For every label present
//! in both trees the cleaner pairs `.xml` annotations with images by file
//! stem, deletes the files without a partner, checks that the pairing is now
//! exact and copies the images into a single staging directory.
//!
//! Deletion is destructive and irreversible, but idempotent: a second run over
//! the same directories finds equal stem sets and deletes nothing.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::mpsc::Sender,
};

use crate::{
    Error,
    utils::{Progress, send_progress, stem_of},
};
use log::{debug, info};
use walkdir::WalkDir;

/// Annotation file suffix.
pub const ANNOTATION_EXTENSION: &str = ".xml";

/// Files of one directory grouped by stem.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileStemSet {
    files: BTreeMap<String, Vec<PathBuf>>,
}

impl FileStemSet {
    /// Scan the direct children of `dir` whose name ends with `suffix`.
    pub fn scan(dir: &Path, suffix: &str) -> Result<Self, Error> {
        let mut files: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.ends_with(suffix) {
                files
                    .entry(stem_of(name).to_string())
                    .or_default()
                    .push(entry.path());
            }
        }
        Ok(Self { files })
    }

    pub fn stems(&self) -> BTreeSet<&str> {
        self.files.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, stem: &str) -> bool {
        self.files.contains_key(stem)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Files whose stem is not in `other`.
    fn orphans<'a>(
        &'a self,
        other: &'a FileStemSet,
    ) -> impl Iterator<Item = (&'a str, &'a PathBuf)> {
        self.files
            .iter()
            .filter(|(stem, _)| !other.contains(stem))
            .flat_map(|(stem, paths)| paths.iter().map(move |path| (stem.as_str(), path)))
    }
}

/// Outcome of cleaning one label directory pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelReport {
    pub label: String,
    pub annotation_files: usize,
    pub image_files: usize,
    pub common: usize,
    pub deleted_annotations: Vec<String>,
    pub deleted_images: Vec<String>,
    pub copied: usize,
}

/// Outcome of a full cleaning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleaningReport {
    pub labels: Vec<LabelReport>,
}

impl CleaningReport {
    pub fn deleted(&self) -> usize {
        self.labels
            .iter()
            .map(|l| l.deleted_annotations.len() + l.deleted_images.len())
            .sum()
    }

    pub fn copied(&self) -> usize {
        self.labels.iter().map(|l| l.copied).sum()
    }
}

/// Cleaner for a single label's annotation and image directories.
#[derive(Debug, Clone)]
pub struct DataCleaner {
    annotations_dir: PathBuf,
    image_dir: PathBuf,
    image_suffix: String,
    annotation_stems: FileStemSet,
    image_stems: FileStemSet,
}

impl DataCleaner {
    /// Scan both directories. `image_extension` is matched case-sensitively,
    /// e.g. `JPEG`.
    pub fn new(
        annotations_dir: &Path,
        image_dir: &Path,
        image_extension: &str,
    ) -> Result<Self, Error> {
        let image_suffix = format!(".{}", image_extension);
        let annotation_stems = FileStemSet::scan(annotations_dir, ANNOTATION_EXTENSION)?;
        let image_stems = FileStemSet::scan(image_dir, &image_suffix)?;

        info!(
            "Cleaning data for {}",
            annotations_dir
                .file_name()
                .map(|n| n.to_string_lossy())
                .unwrap_or_default()
        );
        info!("\tAnnotation Files Count: {}", annotation_stems.len());
        info!("\tImage Files Count: {}", image_stems.len());

        Ok(Self {
            annotations_dir: annotations_dir.to_path_buf(),
            image_dir: image_dir.to_path_buf(),
            image_suffix,
            annotation_stems,
            image_stems,
        })
    }

    pub fn annotation_stems(&self) -> &FileStemSet {
        &self.annotation_stems
    }

    pub fn image_stems(&self) -> &FileStemSet {
        &self.image_stems
    }

    /// Number of stems present in both directories.
    pub fn common(&self) -> usize {
        self.annotation_stems
            .stems()
            .intersection(&self.image_stems.stems())
            .count()
    }

    /// Delete annotations without an image and images without an annotation.
    ///
    /// Returns the deleted `(annotation, image)` stems.
    pub fn delete_files(&self) -> Result<(Vec<String>, Vec<String>), Error> {
        info!("\tnumber of common files: {}", self.common());

        let mut deleted_annotations = Vec::new();
        for (stem, path) in self.annotation_stems.orphans(&self.image_stems) {
            debug!("deleting annotation {:?}", path);
            std::fs::remove_file(path)?;
            deleted_annotations.push(stem.to_string());
        }

        let mut deleted_images = Vec::new();
        for (stem, path) in self.image_stems.orphans(&self.annotation_stems) {
            debug!("deleting image {:?}", path);
            std::fs::remove_file(path)?;
            deleted_images.push(stem.to_string());
        }

        Ok((deleted_annotations, deleted_images))
    }

    /// Re-scan both directories and check that their stem sets are equal.
    pub fn is_data_valid(&self) -> Result<bool, Error> {
        let annotations = FileStemSet::scan(&self.annotations_dir, ANNOTATION_EXTENSION)?;
        let images = FileStemSet::scan(&self.image_dir, &self.image_suffix)?;

        if annotations.stems() == images.stems() {
            info!("\tData is valid!");
            Ok(true)
        } else {
            let only_annotations: Vec<_> = annotations
                .stems()
                .difference(&images.stems())
                .map(|s| s.to_string())
                .collect();
            let only_images: Vec<_> = images
                .stems()
                .difference(&annotations.stems())
                .map(|s| s.to_string())
                .collect();
            Err(Error::DataValidation(format!(
                "{:?}: annotations without images {:?}, images without annotations {:?}",
                self.annotations_dir, only_annotations, only_images
            )))
        }
    }
}

/// Copy each file from `src` into `dest`, recreating sub-directories.
///
/// Returns the number of files copied.
pub fn recursive_copy(src: &Path, dest: &Path) -> Result<usize, Error> {
    std::fs::create_dir_all(dest)?;
    let mut copied = 0;
    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let target = dest.join(entry.path().strip_prefix(src)?);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Label directories present in both trees, sorted.
pub fn common_labels(annotations_dir: &Path, image_dir: &Path) -> Result<Vec<String>, Error> {
    let mut labels = Vec::new();
    for entry in std::fs::read_dir(image_dir)? {
        let entry = entry?;
        let label = entry.file_name().to_string_lossy().into_owned();
        if entry.path().is_dir() && annotations_dir.join(&label).is_dir() {
            labels.push(label);
        } else {
            debug!("skipping {:?}: no matching label directory", entry.path());
        }
    }
    labels.sort();
    Ok(labels)
}

/// Clean every label present in both directories and stage the reconciled
/// images into `staging_dir`.
pub fn clean_data(
    annotations_dir: &Path,
    image_dir: &Path,
    staging_dir: &Path,
    image_extension: &str,
    progress: Option<Sender<Progress>>,
) -> Result<CleaningReport, Error> {
    let labels = common_labels(annotations_dir, image_dir)?;
    let mut report = CleaningReport::default();

    for (idx, label) in labels.iter().enumerate() {
        let ann_path = annotations_dir.join(label);
        let img_path = image_dir.join(label);

        let cleaner = DataCleaner::new(&ann_path, &img_path, image_extension)?;
        let (deleted_annotations, deleted_images) = cleaner.delete_files()?;
        cleaner.is_data_valid()?;
        let copied = recursive_copy(&img_path, staging_dir)?;

        report.labels.push(LabelReport {
            label: label.clone(),
            annotation_files: cleaner.annotation_stems().len(),
            image_files: cleaner.image_stems().len(),
            common: cleaner.common(),
            deleted_annotations,
            deleted_images,
            copied,
        });
        send_progress(&progress, idx + 1, labels.len(), Some(label));
    }

    info!(
        "cleaned {} labels: {} files deleted, {} images staged",
        report.labels.len(),
        report.deleted(),
        report.copied()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, names: &[&str]) -> Result<(), Error> {
        std::fs::create_dir_all(dir)?;
        for name in names {
            std::fs::write(dir.join(name), b"data")?;
        }
        Ok(())
    }

    fn names(dir: &Path) -> Result<BTreeSet<String>, Error> {
        let mut names = BTreeSet::new();
        for entry in std::fs::read_dir(dir)? {
            names.insert(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_clean_removes_orphans() -> Result<(), Error> {
        let temp = TempDir::new()?;
        let annotations = temp.path().join("annotations");
        let images = temp.path().join("images");
        let staging = temp.path().join("allImages");
        touch(&annotations.join("cat"), &["a.xml", "b.xml", "c.xml"])?;
        touch(&images.join("cat"), &["b.JPEG", "c.JPEG", "d.JPEG"])?;

        let report = clean_data(&annotations, &images, &staging, "JPEG", None)?;

        assert_eq!(names(&annotations.join("cat"))?, set(&["b.xml", "c.xml"]));
        assert_eq!(names(&images.join("cat"))?, set(&["b.JPEG", "c.JPEG"]));
        assert_eq!(names(&staging)?, set(&["b.JPEG", "c.JPEG"]));

        let label = &report.labels[0];
        assert_eq!(label.common, 2);
        assert_eq!(label.deleted_annotations, vec!["a".to_string()]);
        assert_eq!(label.deleted_images, vec!["d".to_string()]);
        assert_eq!(label.copied, 2);
        Ok(())
    }

    #[test]
    fn test_clean_is_idempotent() -> Result<(), Error> {
        let temp = TempDir::new()?;
        let annotations = temp.path().join("annotations");
        let images = temp.path().join("images");
        touch(&annotations.join("dog"), &["a.xml", "b.xml"])?;
        touch(&images.join("dog"), &["b.JPEG", "e.JPEG"])?;

        let first = clean_data(&annotations, &images, &temp.path().join("s1"), "JPEG", None)?;
        assert_eq!(first.deleted(), 2);

        let cleaner = DataCleaner::new(&annotations.join("dog"), &images.join("dog"), "JPEG")?;
        assert!(cleaner.is_data_valid()?);

        let second = clean_data(&annotations, &images, &temp.path().join("s2"), "JPEG", None)?;
        assert_eq!(second.deleted(), 0);
        assert!(cleaner.is_data_valid()?);
        Ok(())
    }

    #[test]
    fn test_labels_in_one_tree_are_skipped() -> Result<(), Error> {
        let temp = TempDir::new()?;
        let annotations = temp.path().join("annotations");
        let images = temp.path().join("images");
        touch(&annotations.join("cat"), &["a.xml"])?;
        touch(&images.join("cat"), &["a.JPEG"])?;
        touch(&annotations.join("only_annotations"), &["x.xml"])?;
        touch(&images.join("only_images"), &["y.JPEG"])?;

        let report = clean_data(&annotations, &images, &temp.path().join("staging"), "JPEG", None)?;

        assert_eq!(report.labels.len(), 1);
        assert_eq!(report.labels[0].label, "cat");
        assert!(annotations.join("only_annotations/x.xml").exists());
        assert!(images.join("only_images/y.JPEG").exists());
        Ok(())
    }

    #[test]
    fn test_is_data_valid_reports_mismatch() -> Result<(), Error> {
        let temp = TempDir::new()?;
        let annotations = temp.path().join("a");
        let images = temp.path().join("i");
        touch(&annotations, &["a.xml"])?;
        touch(&images, &["b.JPEG"])?;

        let cleaner = DataCleaner::new(&annotations, &images, "JPEG")?;
        assert!(matches!(cleaner.is_data_valid(), Err(Error::DataValidation(_))));
        Ok(())
    }

    #[test]
    fn test_extension_match_is_case_sensitive() -> Result<(), Error> {
        let temp = TempDir::new()?;
        touch(temp.path(), &["a.JPEG", "b.jpeg", "c.xml"])?;
        let stems = FileStemSet::scan(temp.path(), ".JPEG")?;
        assert_eq!(stems.stems(), BTreeSet::from(["a"]));
        Ok(())
    }

    #[test]
    fn test_recursive_copy_keeps_subdirectories() -> Result<(), Error> {
        let temp = TempDir::new()?;
        let src = temp.path().join("src");
        touch(&src, &["a.JPEG"])?;
        touch(&src.join("nested"), &["b.JPEG"])?;

        let dest = temp.path().join("dest");
        assert_eq!(recursive_copy(&src, &dest)?, 2);
        assert!(dest.join("a.JPEG").is_file());
        assert!(dest.join("nested/b.JPEG").is_file());
        Ok(())
    }
}
