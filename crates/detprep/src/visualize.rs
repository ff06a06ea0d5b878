// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Box rendering for manual inspection of datasets and predictions.

use std::path::{Path, PathBuf};

use crate::{
    Error,
    augment::BoundingBox,
    dataset::{Dataset, DatasetRecord},
};
use image::{ImageFormat, Rgb, RgbImage, imageops};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};
use log::{info, warn};
use polars::prelude::DataFrame;

pub const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
pub const ORANGE: Rgb<u8> = Rgb([255, 140, 0]);
pub const RED: Rgb<u8> = Rgb([255, 0, 0]);

/// Border used when rendering originals, so boxes leaving the frame stay
/// visible.
pub const ORIGINAL_BORDER: u32 = 100;

/// Line width of drawn boxes.
const BOX_THICKNESS: i32 = 2;

/// Pad with a 1px white frame surrounded by a `(by - 1)`px black frame.
pub fn pad(image: &RgbImage, by: u32) -> RgbImage {
    if by == 0 {
        return image.clone();
    }
    let (width, height) = image.dimensions();
    let mut canvas = RgbImage::new(width + 2 * by, height + 2 * by);
    let white = RgbImage::from_pixel(width + 2, height + 2, Rgb([255, 255, 255]));
    imageops::replace(&mut canvas, &white, (by - 1) as i64, (by - 1) as i64);
    imageops::replace(&mut canvas, image, by as i64, by as i64);
    canvas
}

/// Box colour relative to a `width` x `height` frame: green inside, orange
/// crossing the edge, red outside.
pub fn box_color(bbox: &BoundingBox, width: u32, height: u32) -> Rgb<u8> {
    if bbox.is_fully_within(width, height) {
        GREEN
    } else if bbox.is_partly_within(width, height) {
        ORANGE
    } else {
        RED
    }
}

/// Draw `boxes` onto a copy of `image` padded by `border`.
pub fn draw_boxes(image: &RgbImage, boxes: &[BoundingBox], border: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let mut canvas = pad(image, border);
    for bbox in boxes {
        let color = box_color(bbox, width, height);
        let shifted = bbox.shift(border as f64, border as f64);
        draw_box(&mut canvas, &shifted, color);
    }
    canvas
}

fn draw_box(canvas: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let x = bbox.x1.round() as i32;
    let y = bbox.y1.round() as i32;
    let width = (bbox.x2 - bbox.x1).round().max(1.0) as i32;
    let height = (bbox.y2 - bbox.y1).round().max(1.0) as i32;
    for inset in 0..BOX_THICKNESS {
        let w = (width - 2 * inset).max(1) as u32;
        let h = (height - 2 * inset).max(1) as u32;
        draw_hollow_rect_mut(canvas, Rect::at(x + inset, y + inset).of_size(w, h), color);
    }
}

/// Render one record's ground truth. Returns `None` when it has no image.
pub fn render_record(record: &DatasetRecord, border: u32) -> Result<Option<RgbImage>, Error> {
    let Some(image) = &record.image else {
        return Ok(None);
    };
    let boxes: Vec<BoundingBox> = record
        .annotations
        .iter()
        .map(BoundingBox::from_annotation)
        .collect();
    Ok(Some(draw_boxes(&image.decode()?, &boxes, border)))
}

/// Write every record with its ground truth drawn over a padded frame as
/// `<n>.JPEG`. Returns the written paths.
pub fn visualize_original(dataset: &Dataset, output_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    std::fs::create_dir_all(output_dir)?;
    let mut written = Vec::new();
    for (count, record) in dataset.records().iter().enumerate() {
        match render_record(record, ORIGINAL_BORDER)? {
            Some(rendered) => {
                let path = output_dir.join(format!("{}.JPEG", count));
                rendered.save_with_format(&path, ImageFormat::Jpeg)?;
                written.push(path);
            }
            None => warn!("{}: no image to render", record.path),
        }
    }
    info!("rendered {} images into {:?}", written.len(), output_dir);
    Ok(written)
}

/// Summary of the first `limit` rows that have an image, optionally writing
/// those rows with their ground truth drawn into `draw_dir`.
pub fn explore(
    dataset_path: &Path,
    limit: usize,
    draw_dir: Option<&Path>,
) -> Result<DataFrame, Error> {
    let dataset = Dataset::load(dataset_path)?.drop_missing_images();
    info!("{:?}: {}", dataset_path, dataset);
    let head = dataset.head(limit);

    if let Some(dir) = draw_dir {
        std::fs::create_dir_all(dir)?;
        for (idx, record) in head.records().iter().enumerate() {
            if let Some(rendered) = render_record(record, 0)? {
                rendered.save_with_format(dir.join(format!("{}.JPEG", idx)), ImageFormat::Jpeg)?;
            }
        }
    }

    head.summary_dataframe()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Annotation, Coordinates, ImageData, dataset_file, path_key};
    use tempfile::TempDir;

    #[test]
    fn test_pad_frame() {
        let image = RgbImage::from_pixel(4, 3, Rgb([7, 7, 7]));
        let padded = pad(&image, 3);
        assert_eq!(padded.dimensions(), (10, 9));
        assert_eq!(padded.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(padded.get_pixel(2, 2), &Rgb([255, 255, 255]));
        assert_eq!(padded.get_pixel(7, 6), &Rgb([255, 255, 255]));
        assert_eq!(padded.get_pixel(3, 3), &Rgb([7, 7, 7]));
        assert_eq!(pad(&image, 0), image);
    }

    #[test]
    fn test_box_colors() {
        let inside = BoundingBox::new(10.0, 10.0, 20.0, 20.0, "a");
        assert_eq!(box_color(&inside, 50, 50), GREEN);
        assert_eq!(box_color(&inside.shift(-15.0, 0.0), 50, 50), ORANGE);
        assert_eq!(box_color(&inside.shift(100.0, 0.0), 50, 50), RED);
    }

    #[test]
    fn test_draw_boxes_outside_frame() {
        let image = RgbImage::new(20, 20);
        let outside = BoundingBox::new(-8.0, 2.0, -4.0, 10.0, "a");
        let drawn = draw_boxes(&image, &[outside], 10);
        assert_eq!(drawn.dimensions(), (40, 40));
        assert_eq!(drawn.get_pixel(2, 12), &RED);

        let inside = BoundingBox::new(2.0, 2.0, 10.0, 10.0, "a");
        let drawn = draw_boxes(&image, &[inside], 0);
        assert_eq!(drawn.get_pixel(2, 2), &GREEN);
        assert_eq!(drawn.get_pixel(6, 6), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_explore_and_visualize_original() -> Result<(), Error> {
        let temp = TempDir::new()?;
        let image_path = temp.path().join("a.JPEG");
        RgbImage::from_pixel(32, 32, Rgb([90, 90, 90]))
            .save_with_format(&image_path, ImageFormat::Jpeg)?;

        let mut with_image = DatasetRecord::new(
            path_key(&image_path),
            vec![Annotation::new("cat", Coordinates::new(16.0, 16.0, 8.0, 8.0))],
        );
        with_image.image = Some(ImageData::open(&image_path)?);
        let dataset = Dataset::new(vec![
            DatasetRecord::new("missing.JPEG", vec![]),
            with_image.clone(),
            with_image,
        ]);
        let file = dataset_file(temp.path(), "final");
        dataset.save(&file)?;

        let draw_dir = temp.path().join("explore");
        let summary = explore(&file, 1, Some(&draw_dir))?;
        assert_eq!(summary.height(), 1);
        assert!(draw_dir.join("0.JPEG").is_file());
        assert!(!draw_dir.join("1.JPEG").exists());

        let written = visualize_original(&dataset, &temp.path().join("original"))?;
        assert_eq!(written.len(), 2);
        let rendered = image::open(&written[0])?;
        assert_eq!((rendered.width(), rendered.height()), (232, 232));
        Ok(())
    }
}
