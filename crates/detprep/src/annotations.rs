// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Conversion of Pascal VOC style XML annotations into a [`Dataset`].
//!
//! Each annotation file names its image through a `filename` element and
//! lists its boxes as positional `xmin`/`ymin`/`xmax`/`ymax` elements. Only
//! the local element name is matched, so namespaced and flat documents parse
//! the same way and element order does not matter.

use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
    sync::mpsc::Sender,
};

use crate::{
    Error,
    dataset::{Annotation, Coordinates, Dataset, DatasetRecord, ImageTable, path_key},
    utils::{Progress, send_progress},
};
use log::{debug, info};
use xml::reader::{EventReader, XmlEvent};

/// Positional box corners collected from one annotation file.
///
/// Entry `k` of every list belongs to the `k`-th box.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundingCorners {
    pub label: String,
    pub x_min: Vec<f64>,
    pub y_min: Vec<f64>,
    pub x_max: Vec<f64>,
    pub y_max: Vec<f64>,
}

impl BoundingCorners {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    /// Append one box.
    pub fn push(&mut self, x_min: f64, y_min: f64, x_max: f64, y_max: f64) {
        self.x_min.push(x_min);
        self.y_min.push(y_min);
        self.x_max.push(x_max);
        self.y_max.push(y_max);
    }
}

/// Convert corner lists into center-form annotations, one per box.
///
/// Fails with [`Error::AnnotationFormat`] when the four lists differ in
/// length.
pub fn transform_bounding(bounding: &BoundingCorners) -> Result<Vec<Annotation>, Error> {
    let len = bounding.x_min.len();
    if bounding.y_min.len() != len || bounding.x_max.len() != len || bounding.y_max.len() != len {
        return Err(Error::AnnotationFormat(format!(
            "coordinate lists differ in length: xmin={} ymin={} xmax={} ymax={}",
            len,
            bounding.y_min.len(),
            bounding.x_max.len(),
            bounding.y_max.len()
        )));
    }

    Ok((0..len)
        .map(|k| {
            Annotation::new(
                bounding.label.clone(),
                Coordinates::from_corners(
                    bounding.x_min[k],
                    bounding.y_min[k],
                    bounding.x_max[k],
                    bounding.y_max[k],
                ),
            )
        })
        .collect())
}

/// Parse a pixel coordinate. Decimal text is truncated toward zero.
fn parse_coordinate(tag: &str, text: &str) -> Result<f64, Error> {
    let text = text.trim();
    if let Ok(value) = text.parse::<i64>() {
        return Ok(value as f64);
    }
    text.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(f64::trunc)
        .ok_or_else(|| Error::AnnotationFormat(format!("<{}> is not a number: {:?}", tag, text)))
}

/// Parses annotation files of one dataset into records.
#[derive(Debug, Clone)]
pub struct AnnotationConverter {
    image_extension: String,
}

impl Default for AnnotationConverter {
    fn default() -> Self {
        Self::new("JPEG")
    }
}

impl AnnotationConverter {
    pub fn new(image_extension: impl Into<String>) -> Self {
        Self {
            image_extension: image_extension.into(),
        }
    }

    /// Parse one XML document.
    ///
    /// The record path is `<image_dir>/<filename>.<extension>` and every box
    /// is labelled with `label`.
    pub fn parse_xml<R: Read>(
        &self,
        label: &str,
        reader: R,
        image_dir: &Path,
    ) -> Result<DatasetRecord, Error> {
        let mut filename = None;
        let mut bounding = BoundingCorners::new(label);
        let mut current: Option<String> = None;
        let mut text = String::new();

        for event in EventReader::new(reader) {
            match event? {
                XmlEvent::StartElement { name, .. } => {
                    current = Some(name.local_name);
                    text.clear();
                }
                XmlEvent::Characters(chars) | XmlEvent::CData(chars) => text.push_str(&chars),
                XmlEvent::EndElement { name } => {
                    if current.as_deref() == Some(name.local_name.as_str()) {
                        match name.local_name.as_str() {
                            "filename" => filename = Some(text.trim().to_string()),
                            "xmin" => bounding.x_min.push(parse_coordinate("xmin", &text)?),
                            "ymin" => bounding.y_min.push(parse_coordinate("ymin", &text)?),
                            "xmax" => bounding.x_max.push(parse_coordinate("xmax", &text)?),
                            "ymax" => bounding.y_max.push(parse_coordinate("ymax", &text)?),
                            _ => {}
                        }
                    }
                    current = None;
                    text.clear();
                }
                _ => {}
            }
        }

        let filename = filename
            .filter(|f| !f.is_empty())
            .ok_or_else(|| Error::AnnotationFormat("missing <filename> element".to_string()))?;
        let path = image_dir.join(format!("{}.{}", filename, self.image_extension));

        Ok(DatasetRecord::new(path_key(&path), transform_bounding(&bounding)?))
    }

    /// Parse the annotation file at `path`.
    pub fn parse_file(
        &self,
        label: &str,
        path: &Path,
        image_dir: &Path,
    ) -> Result<DatasetRecord, Error> {
        let reader = BufReader::new(File::open(path)?);
        self.parse_xml(label, reader, image_dir).map_err(|err| match err {
            Error::AnnotationFormat(msg) => Error::AnnotationFormat(format!("{:?}: {}", path, msg)),
            other => other,
        })
    }

    /// Parse every `.xml` file of every label directory below
    /// `annotations_dir`, in sorted order.
    pub fn collect_records(
        &self,
        annotations_dir: &Path,
        image_dir: &Path,
        progress: &Option<Sender<Progress>>,
    ) -> Result<Vec<DatasetRecord>, Error> {
        let mut labels = Vec::new();
        for entry in std::fs::read_dir(annotations_dir)? {
            let entry = entry?;
            if entry.path().is_dir() {
                labels.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
            }
        }
        labels.sort();

        let mut records = Vec::new();
        for (label, label_dir) in labels {
            let mut files = Vec::new();
            for entry in std::fs::read_dir(&label_dir)? {
                let path = entry?.path();
                if path.is_file() && path.to_string_lossy().ends_with(".xml") {
                    files.push(path);
                }
            }
            files.sort();

            let total = files.len();
            send_progress(progress, 0, total, Some(&label));
            for (idx, file) in files.iter().enumerate() {
                let record = self.parse_file(&label, file, image_dir)?;
                debug!("{:?}: {} boxes", file, record.annotations.len());
                records.push(record);
                send_progress(progress, idx + 1, total, Some(&label));
            }
            info!("({}) {} files converted", label, total);
        }
        Ok(records)
    }

    /// Build the original dataset: parse all annotations and left-join the
    /// images found in `image_dir`.
    pub fn convert(
        &self,
        annotations_dir: &Path,
        image_dir: &Path,
        progress: Option<Sender<Progress>>,
    ) -> Result<Dataset, Error> {
        let records = self.collect_records(annotations_dir, image_dir, &progress)?;
        let images = ImageTable::load(image_dir)?;
        let dataset = Dataset::new(records).left_join_images(&images);
        info!("converted dataset: {}", dataset);
        Ok(dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use tempfile::TempDir;

    const TWO_BOXES: &str = r#"<annotation>
        <filename>n0001</filename>
        <object><bndbox>
            <xmin>10</xmin><ymin>10</ymin><xmax>30</xmax><ymax>40</ymax>
        </bndbox></object>
        <object><bndbox>
            <xmin>50</xmin><ymin>20</ymin><xmax>70</xmax><ymax>60</ymax>
        </bndbox></object>
    </annotation>"#;

    #[test]
    fn test_transform_bounding() -> Result<(), Error> {
        let mut bounding = BoundingCorners::new("cat");
        bounding.push(10.0, 10.0, 30.0, 40.0);
        bounding.push(50.0, 20.0, 70.0, 60.0);

        let annotations = transform_bounding(&bounding)?;
        assert_eq!(
            annotations,
            vec![
                Annotation::new("cat", Coordinates::new(20.0, 25.0, 20.0, 30.0)),
                Annotation::new("cat", Coordinates::new(60.0, 40.0, 20.0, 40.0)),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_transform_bounding_length_mismatch() {
        let mut bounding = BoundingCorners::new("cat");
        bounding.push(10.0, 10.0, 30.0, 40.0);
        bounding.y_max.pop();
        assert!(matches!(
            transform_bounding(&bounding),
            Err(Error::AnnotationFormat(_))
        ));
    }

    #[test]
    fn test_transform_bounding_empty() -> Result<(), Error> {
        assert!(transform_bounding(&BoundingCorners::new("cat"))?.is_empty());
        Ok(())
    }

    #[test]
    fn test_parse_xml() -> Result<(), Error> {
        let converter = AnnotationConverter::default();
        let record = converter.parse_xml("cat", TWO_BOXES.as_bytes(), Path::new("allImages"))?;
        assert_eq!(record.path, path_key(&Path::new("allImages").join("n0001.JPEG")));
        assert_eq!(record.annotations.len(), 2);
        assert_eq!(record.annotations[1].coordinates, Coordinates::new(60.0, 40.0, 20.0, 40.0));
        assert!(record.image.is_none());
        Ok(())
    }

    #[test]
    fn test_parse_xml_namespaced_and_unordered() -> Result<(), Error> {
        let xml = r#"<a:annotation xmlns:a="urn:voc">
            <a:bndbox>
                <a:ymax>40</a:ymax><a:xmax>30.9</a:xmax><a:ymin>10</a:ymin><a:xmin>10</a:xmin>
            </a:bndbox>
            <a:filename>img</a:filename>
        </a:annotation>"#;
        let converter = AnnotationConverter::new("png");
        let record = converter.parse_xml("dog", xml.as_bytes(), Path::new("d"))?;
        assert_eq!(record.path, path_key(&Path::new("d").join("img.png")));
        assert_eq!(
            record.annotations,
            vec![Annotation::new("dog", Coordinates::new(20.0, 25.0, 20.0, 30.0))]
        );
        Ok(())
    }

    #[test]
    fn test_parse_xml_errors() {
        let converter = AnnotationConverter::default();
        let missing_filename = "<annotation><xmin>1</xmin></annotation>";
        assert!(matches!(
            converter.parse_xml("cat", missing_filename.as_bytes(), Path::new("d")),
            Err(Error::AnnotationFormat(_))
        ));

        let mismatched =
            "<annotation><filename>a</filename><xmin>1</xmin><ymin>1</ymin></annotation>";
        assert!(matches!(
            converter.parse_xml("cat", mismatched.as_bytes(), Path::new("d")),
            Err(Error::AnnotationFormat(_))
        ));

        let not_a_number = "<annotation><filename>a</filename><xmin>left</xmin></annotation>";
        assert!(matches!(
            converter.parse_xml("cat", not_a_number.as_bytes(), Path::new("d")),
            Err(Error::AnnotationFormat(_))
        ));

        assert!(matches!(
            converter.parse_xml("cat", "<annotation>".as_bytes(), Path::new("d")),
            Err(Error::XmlError(_))
        ));
    }

    #[test]
    fn test_convert_joins_images() -> Result<(), Error> {
        let temp = TempDir::new()?;
        let annotations = temp.path().join("annotations/cat");
        let images = temp.path().join("allImages");
        std::fs::create_dir_all(&annotations)?;
        std::fs::create_dir_all(&images)?;

        std::fs::write(annotations.join("n0001.xml"), TWO_BOXES)?;
        std::fs::write(
            annotations.join("n0002.xml"),
            "<annotation><filename>n0002</filename></annotation>",
        )?;
        std::fs::write(annotations.join("notes.txt"), "ignored")?;
        RgbImage::from_pixel(80, 64, Rgb([10, 20, 30]))
            .save_with_format(images.join("n0001.JPEG"), ImageFormat::Jpeg)?;

        let (tx, rx) = std::sync::mpsc::channel();
        let dataset = AnnotationConverter::default().convert(
            &temp.path().join("annotations"),
            &images,
            Some(tx),
        )?;

        assert_eq!(dataset.len(), 2);
        let first = &dataset.records()[0];
        assert!(first.path.ends_with("n0001.JPEG"));
        assert_eq!(first.image.as_ref().map(|i| (i.width(), i.height())), Some((80, 64)));
        assert!(dataset.records()[1].image.is_none());
        assert!(dataset.records()[1].annotations.is_empty());

        let updates: Vec<Progress> = rx.try_iter().collect();
        assert_eq!(updates.last().map(|p| (p.current, p.total)), Some((2, 2)));
        Ok(())
    }
}
