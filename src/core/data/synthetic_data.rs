use rand::prelude::*;
use rand_distr::{Distribution, Poisson};

use crate::core::data::cells::{CellTable, ImageCells};
use crate::core::spatial::window::Rect;
use crate::error::Result;

/////////////
// Helpers //
/////////////

/// Maximum number of rejection sampling attempts per requested point
const MAX_ATTEMPTS_PER_POINT: usize = 10_000;

/// Sample a point uniformly within a rectangle
fn uniform_in_rect(rect: &Rect, rng: &mut StdRng) -> (f64, f64) {
    (
        rng.random_range(rect.xmin..rect.xmax),
        rng.random_range(rect.ymin..rect.ymax),
    )
}

/////////////////////////
// Synthetic patterns //
/////////////////////////

/// Generate a binomial point pattern (fixed number of uniform points)
///
/// ### Params
///
/// * `n` - Number of points
/// * `rect` - The rectangle to sample within
/// * `rng` - The random number generator
///
/// ### Returns
///
/// Vector of `(x, y)` coordinates
pub fn uniform_points(n: usize, rect: &Rect, rng: &mut StdRng) -> Vec<(f64, f64)> {
    (0..n).map(|_| uniform_in_rect(rect, rng)).collect()
}

/// Generate a homogeneous Poisson point pattern
///
/// ### Params
///
/// * `intensity` - Expected number of points per unit area
/// * `rect` - The rectangle to sample within
/// * `rng` - The random number generator
///
/// ### Returns
///
/// Vector of `(x, y)` coordinates
pub fn homogeneous_poisson(intensity: f64, rect: &Rect, rng: &mut StdRng) -> Vec<(f64, f64)> {
    let lambda = intensity * rect.area();
    let n = match Poisson::new(lambda) {
        Ok(dist) => dist.sample(rng) as usize,
        Err(_) => 0,
    };
    uniform_points(n, rect, rng)
}

/// Plant points within a fixed distance of anchor points
///
/// Every anchor receives `n_per_anchor` points, uniformly distributed over
/// the disc of radius `max_dist` around it and clipped to the rectangle.
///
/// ### Params
///
/// * `anchors` - The anchor coordinates
/// * `n_per_anchor` - Number of points planted per anchor
/// * `max_dist` - Radius of the planting disc
/// * `rect` - The observation window
/// * `rng` - The random number generator
///
/// ### Returns
///
/// Vector of `(x, y)` coordinates
pub fn planted_points(
    anchors: &[(f64, f64)],
    n_per_anchor: usize,
    max_dist: f64,
    rect: &Rect,
    rng: &mut StdRng,
) -> Vec<(f64, f64)> {
    let mut res = Vec::with_capacity(anchors.len() * n_per_anchor);
    for &(ax, ay) in anchors {
        let mut planted = 0;
        let mut attempts = 0;
        while planted < n_per_anchor && attempts < MAX_ATTEMPTS_PER_POINT * n_per_anchor {
            attempts += 1;
            let radius = max_dist * rng.random::<f64>().sqrt();
            let angle = rng.random_range(0.0..std::f64::consts::TAU);
            let (x, y) = (ax + radius * angle.cos(), ay + radius * angle.sin());
            if rect.contains(x, y) {
                res.push((x, y));
                planted += 1;
            }
        }
    }
    res
}

/// Generate uniform points that keep a minimum distance to anchor points
///
/// ### Params
///
/// * `anchors` - The anchor coordinates
/// * `n` - Number of points to generate
/// * `min_dist` - Minimum distance to every anchor
/// * `rect` - The observation window
/// * `rng` - The random number generator
///
/// ### Returns
///
/// Vector of `(x, y)` coordinates (may be shorter than `n` if the free area
/// is too small)
pub fn repelled_points(
    anchors: &[(f64, f64)],
    n: usize,
    min_dist: f64,
    rect: &Rect,
    rng: &mut StdRng,
) -> Vec<(f64, f64)> {
    let min_sq = min_dist * min_dist;
    let mut res = Vec::with_capacity(n);
    let mut attempts = 0;
    while res.len() < n && attempts < MAX_ATTEMPTS_PER_POINT * n.max(1) {
        attempts += 1;
        let (x, y) = uniform_in_rect(rect, rng);
        let free = anchors
            .iter()
            .all(|&(ax, ay)| (ax - x).powi(2) + (ay - y).powi(2) >= min_sq);
        if free {
            res.push((x, y));
        }
    }
    res
}

/////////////////////
// Image assembly //
/////////////////////

/// Builder for synthetic images
///
/// ### Fields
///
/// * `image_id` - The image identifier
/// * `subject_id` - Optional subject identifier
/// * `cells` - Cell type and coordinates of every cell added so far
#[derive(Debug, Clone)]
pub struct SyntheticImage {
    pub image_id: String,
    pub subject_id: Option<String>,
    pub cells: Vec<(String, f64, f64)>,
}

impl SyntheticImage {
    /// Start a new empty image
    pub fn new(image_id: &str) -> Self {
        Self {
            image_id: image_id.to_string(),
            subject_id: None,
            cells: Vec::new(),
        }
    }

    /// Set the subject of the image
    pub fn with_subject(mut self, subject_id: &str) -> Self {
        self.subject_id = Some(subject_id.to_string());
        self
    }

    /// Add points of one cell type
    pub fn add(mut self, cell_type: &str, points: &[(f64, f64)]) -> Self {
        self.cells
            .extend(points.iter().map(|&(x, y)| (cell_type.to_string(), x, y)));
        self
    }

    /// Convert into the `ImageCells` of this image
    pub fn into_image(self) -> ImageCells {
        let n = self.cells.len();
        ImageCells {
            subject_ids: self.subject_id.map(|s| vec![s; n]),
            cell_id: (0..n).map(|i| format!("cell_{}", i)).collect(),
            cell_type: self.cells.iter().map(|c| c.0.clone()).collect(),
            x: self.cells.iter().map(|c| c.1).collect(),
            y: self.cells.iter().map(|c| c.2).collect(),
            image_id: self.image_id,
        }
    }
}

/// Combine synthetic images into one cell table
///
/// ### Params
///
/// * `images` - The synthetic images. If any image has a subject, all
///   images without one use their image id as subject.
///
/// ### Returns
///
/// The `CellTable` holding all cells
pub fn combine_images(images: Vec<SyntheticImage>) -> Result<CellTable> {
    let with_subjects = images.iter().any(|img| img.subject_id.is_some());
    let mut cell_id = Vec::new();
    let mut image_id = Vec::new();
    let mut subject_id = Vec::new();
    let mut cell_type = Vec::new();
    let mut x = Vec::new();
    let mut y = Vec::new();

    for img in images {
        let subject = img.subject_id.clone().unwrap_or_else(|| img.image_id.clone());
        for (i, (t, cx, cy)) in img.cells.into_iter().enumerate() {
            cell_id.push(format!("cell_{}", i));
            image_id.push(img.image_id.clone());
            subject_id.push(subject.clone());
            cell_type.push(t);
            x.push(cx);
            y.push(cy);
        }
    }

    let table = CellTable::new(cell_id, image_id, cell_type, x, y)?;
    if with_subjects {
        table.with_subjects(subject_id)
    } else {
        Ok(table)
    }
}

///////////
// Tests //
///////////
