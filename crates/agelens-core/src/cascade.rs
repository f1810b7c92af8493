//! Boosted Haar-feature cascade in the OpenCV XML format.
//!
//! Reads `haarcascade_*.xml` files written by `opencv_traincascade` (the
//! "new" format with a top-level `<cascade>` node) and evaluates a single
//! detection window against an integral image.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Stage thresholds are stored shifted down by this amount so that a stage
/// sum exactly at the trained threshold still passes.
const STAGE_THRESHOLD_EPS: f32 = 1e-5;
/// Fields per internal node in `<internalNodes>`: left, right, feature, threshold.
const NODE_FIELDS: usize = 4;
/// Fields per rectangle in `<rects>`: x, y, width, height, weight.
const RECT_FIELDS: usize = 5;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}")]
    NotFound(String),
    #[error("failed to read cascade: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed cascade XML: {0}")]
    Xml(#[from] quick_xml::DeError),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
    #[error("invalid cascade data: {0}")]
    Invalid(String),
}

// --- XML document shape ---

#[derive(Deserialize)]
struct StorageXml {
    cascade: CascadeXml,
}

#[derive(Deserialize)]
struct CascadeXml {
    #[serde(rename = "stageType")]
    stage_type: String,
    #[serde(rename = "featureType")]
    feature_type: String,
    height: String,
    width: String,
    stages: ListXml<StageXml>,
    features: ListXml<FeatureXml>,
}

/// OpenCV serializes sequences as repeated `<_>` children.
#[derive(Deserialize)]
struct ListXml<T> {
    #[serde(rename = "_", default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
struct StageXml {
    #[serde(rename = "stageThreshold")]
    threshold: String,
    #[serde(rename = "weakClassifiers")]
    weak_classifiers: ListXml<WeakXml>,
}

#[derive(Deserialize)]
struct WeakXml {
    #[serde(rename = "internalNodes")]
    internal_nodes: String,
    #[serde(rename = "leafValues")]
    leaf_values: String,
}

#[derive(Deserialize)]
struct FeatureXml {
    rects: ListXml<String>,
    #[serde(default)]
    tilted: Option<String>,
}

// --- Evaluated model ---

#[derive(Debug, Clone, Copy)]
struct WeightedRect {
    x: usize,
    y: usize,
    width: usize,
    height: usize,
    weight: f64,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

/// Internal tree node. A child `<= 0` is a leaf index (negated).
#[derive(Debug, Clone, Copy)]
struct Node {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f64,
}

#[derive(Debug, Clone)]
struct WeakTree {
    nodes: Vec<Node>,
    leaves: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f64,
    trees: Vec<WeakTree>,
}

/// Outcome of evaluating one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WindowResult {
    Accepted,
    /// Rejected by the stage with this index.
    RejectedAt(usize),
}

/// A loaded Haar cascade.
#[derive(Debug, Clone)]
pub struct Cascade {
    window_width: usize,
    window_height: usize,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl Cascade {
    /// Load a cascade XML file from disk.
    pub fn load(path: &Path) -> Result<Self, CascadeError> {
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path)?;
        let cascade = Self::from_xml_str(&xml)?;

        tracing::info!(
            path = %path.display(),
            window = ?cascade.window_size(),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );

        Ok(cascade)
    }

    /// Parse a cascade from XML text.
    pub fn from_xml_str(xml: &str) -> Result<Self, CascadeError> {
        let doc: StorageXml = quick_xml::de::from_str(xml)?;
        let raw = doc.cascade;

        if raw.stage_type.trim() != "BOOST" {
            return Err(CascadeError::Unsupported(format!(
                "stage type {:?} (need BOOST)",
                raw.stage_type.trim()
            )));
        }
        if raw.feature_type.trim() != "HAAR" {
            return Err(CascadeError::Unsupported(format!(
                "feature type {:?} (need HAAR)",
                raw.feature_type.trim()
            )));
        }

        let window_width: usize = parse_field(&raw.width, "width")?;
        let window_height: usize = parse_field(&raw.height, "height")?;
        if window_width < 3 || window_height < 3 {
            return Err(CascadeError::Invalid(format!(
                "window {window_width}x{window_height} is too small"
            )));
        }

        let features = raw
            .features
            .items
            .iter()
            .enumerate()
            .map(|(i, f)| parse_feature(f, window_width, window_height).map_err(|e| tag(e, "feature", i)))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = raw
            .stages
            .items
            .iter()
            .enumerate()
            .map(|(i, s)| parse_stage(s, features.len()).map_err(|e| tag(e, "stage", i)))
            .collect::<Result<Vec<_>, _>>()?;

        if stages.is_empty() {
            return Err(CascadeError::Invalid("cascade has no stages".into()));
        }

        Ok(Self {
            window_width,
            window_height,
            stages,
            features,
        })
    }

    /// Base detection window (width, height) in pixels.
    pub fn window_size(&self) -> (usize, usize) {
        (self.window_width, self.window_height)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Run all stages on the window whose top-left corner is `(x, y)`.
    ///
    /// The caller guarantees the window lies inside the integral image.
    pub(crate) fn evaluate(&self, ii: &IntegralImage, x: usize, y: usize) -> WindowResult {
        // Variance normalization over the window shrunk by one pixel per side.
        let (nx, ny) = (x + 1, y + 1);
        let (nw, nh) = (self.window_width - 2, self.window_height - 2);
        let area = (nw * nh) as f64;
        let sum = ii.rect_sum(nx, ny, nw, nh) as f64;
        let sq_sum = ii.rect_sq_sum(nx, ny, nw, nh) as f64;
        let nf = area * sq_sum - sum * sum;
        let inv_norm = if nf > 0.0 { 1.0 / nf.sqrt() } else { 1.0 };

        let feature_value = |idx: usize| -> f64 {
            let raw: f64 = self.features[idx]
                .rects
                .iter()
                .map(|r| r.weight * ii.rect_sum(x + r.x, y + r.y, r.width, r.height) as f64)
                .sum();
            raw * inv_norm
        };

        for (stage_idx, stage) in self.stages.iter().enumerate() {
            let mut stage_sum = 0.0f64;
            for tree in &stage.trees {
                let mut idx = 0usize;
                let leaf = loop {
                    let node = &tree.nodes[idx];
                    let next = if feature_value(node.feature) < node.threshold {
                        node.left
                    } else {
                        node.right
                    };
                    if next <= 0 {
                        break tree.leaves[next.unsigned_abs() as usize];
                    }
                    idx = next as usize;
                };
                stage_sum += leaf;
            }
            if stage_sum < stage.threshold {
                return WindowResult::RejectedAt(stage_idx);
            }
        }

        WindowResult::Accepted
    }
}

fn tag(err: CascadeError, what: &str, idx: usize) -> CascadeError {
    match err {
        CascadeError::Invalid(msg) => CascadeError::Invalid(format!("{what} {idx}: {msg}")),
        CascadeError::Unsupported(msg) => CascadeError::Unsupported(format!("{what} {idx}: {msg}")),
        other => other,
    }
}

fn parse_field<T: std::str::FromStr>(text: &str, name: &str) -> Result<T, CascadeError> {
    text.trim()
        .parse()
        .map_err(|_| CascadeError::Invalid(format!("{name}: cannot parse {:?}", text.trim())))
}

fn parse_numbers(text: &str, name: &str) -> Result<Vec<f64>, CascadeError> {
    text.split_whitespace()
        .map(|tok| parse_field::<f64>(tok, name))
        .collect()
}

fn parse_feature(raw: &FeatureXml, win_w: usize, win_h: usize) -> Result<HaarFeature, CascadeError> {
    if let Some(tilted) = &raw.tilted {
        if tilted.trim() != "0" {
            return Err(CascadeError::Unsupported("tilted features".into()));
        }
    }
    if raw.rects.items.is_empty() || raw.rects.items.len() > 3 {
        return Err(CascadeError::Invalid(format!(
            "expected 1-3 rectangles, got {}",
            raw.rects.items.len()
        )));
    }

    let mut rects = Vec::with_capacity(raw.rects.items.len());
    for text in &raw.rects.items {
        let v = parse_numbers(text, "rects")?;
        if v.len() != RECT_FIELDS {
            return Err(CascadeError::Invalid(format!(
                "rectangle needs {RECT_FIELDS} values, got {}",
                v.len()
            )));
        }
        if v[..4].iter().any(|&c| c < 0.0 || c.fract() != 0.0) {
            return Err(CascadeError::Invalid(format!("rectangle {text:?} has bad coordinates")));
        }
        let rect = WeightedRect {
            x: v[0] as usize,
            y: v[1] as usize,
            width: v[2] as usize,
            height: v[3] as usize,
            weight: v[4],
        };
        if rect.x + rect.width > win_w || rect.y + rect.height > win_h {
            return Err(CascadeError::Invalid(format!(
                "rectangle {text:?} exceeds {win_w}x{win_h} window"
            )));
        }
        rects.push(rect);
    }

    Ok(HaarFeature { rects })
}

fn parse_stage(raw: &StageXml, feature_count: usize) -> Result<Stage, CascadeError> {
    let threshold: f32 = parse_field(&raw.threshold, "stageThreshold")?;

    let trees = raw
        .weak_classifiers
        .items
        .iter()
        .map(|w| parse_tree(w, feature_count))
        .collect::<Result<Vec<_>, _>>()?;

    if trees.is_empty() {
        return Err(CascadeError::Invalid("stage has no weak classifiers".into()));
    }

    Ok(Stage {
        threshold: (threshold - STAGE_THRESHOLD_EPS) as f64,
        trees,
    })
}

fn parse_tree(raw: &WeakXml, feature_count: usize) -> Result<WeakTree, CascadeError> {
    let values = parse_numbers(&raw.internal_nodes, "internalNodes")?;
    let leaves = parse_numbers(&raw.leaf_values, "leafValues")?;

    if values.is_empty() || values.len() % NODE_FIELDS != 0 {
        return Err(CascadeError::Unsupported(format!(
            "internalNodes must hold groups of {NODE_FIELDS} values, got {} (categorical features?)",
            values.len()
        )));
    }

    let nodes: Vec<Node> = values
        .chunks_exact(NODE_FIELDS)
        .map(|c| Node {
            left: c[0] as i32,
            right: c[1] as i32,
            feature: c[2] as usize,
            threshold: c[3],
        })
        .collect();

    for (i, node) in nodes.iter().enumerate() {
        if node.feature >= feature_count {
            return Err(CascadeError::Invalid(format!(
                "node {i} references feature {} of {feature_count}",
                node.feature
            )));
        }
        for child in [node.left, node.right] {
            let ok = if child > 0 {
                // Children always come after their parent, so walks terminate.
                (child as usize) > i && (child as usize) < nodes.len()
            } else {
                (child.unsigned_abs() as usize) < leaves.len()
            };
            if !ok {
                return Err(CascadeError::Invalid(format!("node {i} has dangling child {child}")));
            }
        }
    }

    Ok(WeakTree { nodes, leaves })
}

/// Summed-area tables for O(1) rectangle sums and squared sums.
pub(crate) struct IntegralImage {
    stride: usize,
    sum: Vec<i64>,
    sq_sum: Vec<i64>,
}

impl IntegralImage {
    pub(crate) fn new(gray: &[u8], width: usize, height: usize) -> Self {
        let stride = width + 1;
        let mut sum = vec![0i64; stride * (height + 1)];
        let mut sq_sum = vec![0i64; stride * (height + 1)];

        for y in 0..height {
            let mut row = 0i64;
            let mut row_sq = 0i64;
            for x in 0..width {
                let v = gray[y * width + x] as i64;
                row += v;
                row_sq += v * v;
                let idx = (y + 1) * stride + x + 1;
                sum[idx] = sum[idx - stride] + row;
                sq_sum[idx] = sq_sum[idx - stride] + row_sq;
            }
        }

        Self { stride, sum, sq_sum }
    }

    fn corners(&self, table: &[i64], x: usize, y: usize, w: usize, h: usize) -> i64 {
        let s = self.stride;
        table[(y + h) * s + x + w] - table[y * s + x + w] - table[(y + h) * s + x] + table[y * s + x]
    }

    pub(crate) fn rect_sum(&self, x: usize, y: usize, w: usize, h: usize) -> i64 {
        self.corners(&self.sum, x, y, w, h)
    }

    pub(crate) fn rect_sq_sum(&self, x: usize, y: usize, w: usize, h: usize) -> i64 {
        self.corners(&self.sq_sum, x, y, w, h)
    }
}
