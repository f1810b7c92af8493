//! Multiscale Haar-cascade face locator.
//!
//! Scans a luma pyramid with the cascade's base window, then merges raw hits
//! into neighbor-supported groups. Output order is discovery order: classes
//! are numbered by their first raw hit, scanning small scales first and
//! rows top to bottom.

use crate::cascade::{Cascade, CascadeError, IntegralImage, WindowResult};
use crate::preprocess::resize_bilinear;
use crate::types::{FaceRegion, Image};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

// --- Named constants ---
const DEFAULT_SCALE_FACTOR: f64 = 1.1;
const DEFAULT_MIN_NEIGHBORS: usize = 5;
const DEFAULT_MIN_SIZE: u32 = 65;
/// Relative tolerance used both for grouping similar hits and for dropping
/// groups nested inside stronger ones.
const GROUP_EPS: f64 = 0.2;

#[derive(Error, Debug)]
pub enum LocatorError {
    #[error("cascade: {0}")]
    Cascade(#[from] CascadeError),
    #[error("invalid locator parameters: {0}")]
    InvalidParams(String),
}

/// Scan parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorParams {
    /// Growth of the scan window between pyramid levels.
    pub scale_factor: f64,
    /// A group needs more than this many raw hits to be reported.
    /// Zero disables grouping.
    pub min_neighbors: usize,
    /// Smallest window side, in source pixels.
    pub min_size: u32,
    /// Largest window side, in source pixels. `None` means unbounded.
    pub max_size: Option<u32>,
}

impl Default for LocatorParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_size: DEFAULT_MIN_SIZE,
            max_size: None,
        }
    }
}

impl LocatorParams {
    pub fn validate(&self) -> Result<(), LocatorError> {
        if !(self.scale_factor > 1.0) || !self.scale_factor.is_finite() {
            return Err(LocatorError::InvalidParams(format!(
                "scale_factor must be > 1, got {}",
                self.scale_factor
            )));
        }
        if self.min_size == 0 {
            return Err(LocatorError::InvalidParams("min_size must be > 0".into()));
        }
        if let Some(max) = self.max_size {
            if max < self.min_size {
                return Err(LocatorError::InvalidParams(format!(
                    "max_size {max} is below min_size {}",
                    self.min_size
                )));
            }
        }
        Ok(())
    }
}

/// Frontal-face locator. Cheap to clone; the cascade is shared.
#[derive(Debug, Clone)]
pub struct FaceLocator {
    cascade: Arc<Cascade>,
    params: LocatorParams,
}

impl FaceLocator {
    /// Load a cascade XML file and bind it to `params`.
    pub fn load(cascade_path: &Path, params: LocatorParams) -> Result<Self, LocatorError> {
        Self::new(Cascade::load(cascade_path)?, params)
    }

    pub fn new(cascade: Cascade, params: LocatorParams) -> Result<Self, LocatorError> {
        params.validate()?;
        Ok(Self {
            cascade: Arc::new(cascade),
            params,
        })
    }

    /// Find candidate face regions. An empty result means "no face".
    pub fn locate(&self, image: &Image) -> Vec<FaceRegion> {
        let (img_w, img_h) = (image.width() as usize, image.height() as usize);
        let luma = image.to_luma();
        let (win_w, win_h) = self.cascade.window_size();

        let mut raw = Vec::new();
        for factor in self.scales(img_w, img_h) {
            let scaled_w = (img_w as f64 / factor).round() as usize;
            let scaled_h = (img_h as f64 / factor).round() as usize;
            let window_w = (win_w as f64 * factor).round() as i32;
            let window_h = (win_h as f64 * factor).round() as i32;

            let scaled = if scaled_w == img_w && scaled_h == img_h {
                luma.clone()
            } else {
                resize_bilinear(&luma, img_w, img_h, 1, scaled_w, scaled_h)
            };
            let ii = IntegralImage::new(&scaled, scaled_w, scaled_h);

            let step = if factor > 2.0 { 1 } else { 2 };
            let (work_w, work_h) = (scaled_w - win_w, scaled_h - win_h);

            for y in (0..work_h).step_by(step) {
                let mut x = 0;
                while x < work_w {
                    match self.cascade.evaluate(&ii, x, y) {
                        WindowResult::Accepted => raw.push(FaceRegion::new(
                            (x as f64 * factor).round() as i32,
                            (y as f64 * factor).round() as i32,
                            window_w,
                            window_h,
                        )),
                        // Rejected outright: the neighbouring column is skipped too.
                        WindowResult::RejectedAt(0) => x += step,
                        WindowResult::RejectedAt(_) => {}
                    }
                    x += step;
                }
            }
        }

        let raw_hits = raw.len();
        let regions: Vec<FaceRegion> = group_rectangles(raw, self.params.min_neighbors, GROUP_EPS)
            .into_iter()
            .filter_map(|r| clip_to(r, image.width(), image.height()))
            .collect();

        tracing::debug!(
            width = img_w,
            height = img_h,
            raw_hits,
            faces = regions.len(),
            "face locator scan complete"
        );

        regions
    }

    /// Pyramid factors whose window fits the size limits and the image.
    fn scales(&self, img_w: usize, img_h: usize) -> Vec<f64> {
        let (win_w, win_h) = self.cascade.window_size();
        let min = self.params.min_size as i64;
        let mut scales = Vec::new();
        let mut factor = 1.0f64;

        loop {
            let window_w = (win_w as f64 * factor).round() as i64;
            let window_h = (win_h as f64 * factor).round() as i64;
            let scaled_w = (img_w as f64 / factor).round() as usize;
            let scaled_h = (img_h as f64 / factor).round() as usize;

            if scaled_w <= win_w || scaled_h <= win_h {
                break;
            }
            if let Some(max) = self.params.max_size {
                if window_w > max as i64 || window_h > max as i64 {
                    break;
                }
            }
            if window_w >= min && window_h >= min {
                scales.push(factor);
            }
            factor *= self.params.scale_factor;
        }

        scales
    }
}

/// Pick the one region carried forward per request: the first one found.
pub fn select_canonical(regions: &[FaceRegion]) -> Option<FaceRegion> {
    regions.first().copied()
}

/// Intersect a region with the image, dropping it if nothing is left.
fn clip_to(r: FaceRegion, width: u32, height: u32) -> Option<FaceRegion> {
    let x0 = r.x.max(0);
    let y0 = r.y.max(0);
    let x1 = (r.x + r.width).min(width as i32);
    let y1 = (r.y + r.height).min(height as i32);
    (x1 > x0 && y1 > y0).then(|| FaceRegion::new(x0, y0, x1 - x0, y1 - y0))
}

/// Whether two hits describe the same object, within `eps` of their size.
fn similar(a: &FaceRegion, b: &FaceRegion, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    let close = |p: i32, q: i32| ((p - q).abs() as f64) <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.x + a.width, b.x + b.width)
        && close(a.y + a.height, b.y + b.height)
}

/// Partition hits into equivalence classes of the transitive `similar`
/// relation. Classes are numbered by their first member.
fn partition(rects: &[FaceRegion], eps: f64) -> (Vec<usize>, usize) {
    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&rects[i], &rects[j], eps) {
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                if a != b {
                    parent[a.max(b)] = a.min(b);
                }
            }
        }
    }

    let mut class_of_root = vec![usize::MAX; n];
    let mut labels = vec![0usize; n];
    let mut classes = 0;
    for i in 0..n {
        let root = find(&mut parent, i);
        if class_of_root[root] == usize::MAX {
            class_of_root[root] = classes;
            classes += 1;
        }
        labels[i] = class_of_root[root];
    }

    (labels, classes)
}

/// Merge raw hits into averaged groups with more than `threshold` members,
/// discarding groups nested inside a better-supported one.
fn group_rectangles(raw: Vec<FaceRegion>, threshold: usize, eps: f64) -> Vec<FaceRegion> {
    if threshold == 0 || raw.is_empty() {
        return raw;
    }

    let (labels, classes) = partition(&raw, eps);
    let mut sums = vec![[0i64; 4]; classes];
    let mut counts = vec![0usize; classes];
    for (rect, &cls) in raw.iter().zip(&labels) {
        let s = &mut sums[cls];
        s[0] += rect.x as i64;
        s[1] += rect.y as i64;
        s[2] += rect.width as i64;
        s[3] += rect.height as i64;
        counts[cls] += 1;
    }

    let averaged: Vec<FaceRegion> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let avg = |v: i64| (v as f64 / n as f64).round() as i32;
            FaceRegion::new(avg(s[0]), avg(s[1]), avg(s[2]), avg(s[3]))
        })
        .collect();

    let mut grouped = Vec::new();
    for (i, r1) in averaged.iter().enumerate() {
        let n1 = counts[i];
        if n1 <= threshold {
            continue;
        }
        let swallowed = averaged.iter().enumerate().any(|(j, r2)| {
            let n2 = counts[j];
            if j == i || n2 <= threshold {
                return false;
            }
            let dx = (r2.width as f64 * eps).round() as i32;
            let dy = (r2.height as f64 * eps).round() as i32;
            r1.x >= r2.x - dx
                && r1.y >= r2.y - dy
                && r1.x + r1.width <= r2.x + r2.width + dx
                && r1.y + r1.height <= r2.y + r2.height + dy
                && (n2 > n1.max(3) || n1 < 3)
        });
        if !swallowed {
            grouped.push(*r1);
        }
    }

    grouped
}
