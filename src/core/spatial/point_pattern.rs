use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;

use crate::core::data::cells::ImageCells;
use crate::core::spatial::density::leave_one_out_intensity;
use crate::core::spatial::neighbours::NeighbourIndex;
use crate::core::spatial::window::{EdgeCorrection, Rect, WindowKind};
use crate::error::{Result, SpatialError};

////////////
// Params //
////////////

/// Parameters of the point pattern statistic
///
/// ### Fields
///
/// * `window` - How the observation window is defined
/// * `edge_correction` - Edge correction applied to the K-function
/// * `min_cells` - Minimum number of cells per type (and parent population);
///   below it the statistic is missing
/// * `sigma` - Optional Gaussian kernel bandwidth for the inhomogeneous
///   K-function
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PointPatternParams {
    pub window: WindowKind,
    pub edge_correction: EdgeCorrection,
    pub min_cells: usize,
    pub sigma: Option<f64>,
}

impl Default for PointPatternParams {
    fn default() -> Self {
        Self {
            window: WindowKind::BoundingBox,
            edge_correction: EdgeCorrection::Isotropic,
            min_cells: 20,
            sigma: None,
        }
    }
}

impl PointPatternParams {
    /// Check the parameters
    pub fn validate(&self) -> Result<()> {
        if let Some(sigma) = self.sigma {
            if !(sigma.is_finite() && sigma > 0.0) {
                return Err(SpatialError::InvalidConfig(format!(
                    "Kernel bandwidth must be positive, got {}",
                    sigma
                )));
            }
        }
        Ok(())
    }
}

/// Check a set of radii
///
/// ### Params
///
/// * `radii` - The radii; must be non-empty, finite and non-negative
///
/// ### Returns
///
/// The largest radius
pub fn validate_radii(radii: &[f64]) -> Result<f64> {
    if radii.is_empty() {
        return Err(SpatialError::InvalidConfig(
            "At least one radius is required".to_string(),
        ));
    }
    if let Some(bad) = radii.iter().find(|r| !(r.is_finite() && **r >= 0.0)) {
        return Err(SpatialError::InvalidConfig(format!(
            "Radii must be finite and non-negative, got {}",
            bad
        )));
    }
    Ok(radii.iter().copied().fold(0.0, f64::max))
}

////////////
// LCurve //
////////////

/// Observed and theoretical L-function over a set of radii
///
/// ### Fields
///
/// * `radii` - The radii in the requested order
/// * `observed` - The observed L-function
/// * `theoretical` - The L-function under complete spatial randomness (`r`)
/// * `n_from` - Number of `from` cells
/// * `n_to` - Number of `to` cells
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LCurve {
    pub radii: Vec<f64>,
    pub observed: Vec<f64>,
    pub theoretical: Vec<f64>,
    pub n_from: usize,
    pub n_to: usize,
}

impl LCurve {
    /// Signed deviation from randomness per radius
    pub fn deviation(&self) -> Vec<f64> {
        self.observed
            .iter()
            .zip(self.theoretical.iter())
            .map(|(o, t)| o - t)
            .collect()
    }

    /// Mean deviation over the radii
    ///
    /// This is the value stored in the association table.
    pub fn summary(&self) -> f64 {
        let dev = self.deviation();
        dev.iter().sum::<f64>() / dev.len() as f64
    }
}

//////////////////
// ImagePattern //
//////////////////

/// One image prepared for repeated K-function evaluation
///
/// Holds the observation window, the neighbour lists up to the largest radius
/// and, when a kernel bandwidth is set, the leave-one-out intensity of every
/// cell within its own type. Every pair and radius of the image is evaluated
/// against the same index.
#[derive(Debug, Clone)]
pub struct ImagePattern {
    x: Vec<f64>,
    y: Vec<f64>,
    window: Rect,
    index: NeighbourIndex,
    members: BTreeMap<String, Vec<usize>>,
    intensity: Option<Vec<f64>>,
    edge_correction: EdgeCorrection,
    min_cells: usize,
}

impl ImagePattern {
    /// Prepare an image
    ///
    /// ### Params
    ///
    /// * `image` - The cells of the image
    /// * `params` - The point pattern parameters
    /// * `max_radius` - The largest radius that will be evaluated
    ///
    /// ### Returns
    ///
    /// The `ImagePattern`, or `InputData` for malformed cells, a degenerate
    /// window or cells outside a fixed window.
    pub fn new(image: &ImageCells, params: &PointPatternParams, max_radius: f64) -> Result<Self> {
        params.validate()?;
        image.validate()?;

        let window = match params.window {
            WindowKind::BoundingBox => Rect::bounding_box(&image.x, &image.y).ok_or_else(|| {
                SpatialError::input(&image.image_id, "observation window has zero area")
            })?,
            WindowKind::Fixed(rect) => {
                let outside = image
                    .x
                    .iter()
                    .zip(image.y.iter())
                    .filter(|(x, y)| !rect.contains(**x, **y))
                    .count();
                if outside > 0 {
                    return Err(SpatialError::input(
                        &image.image_id,
                        format!("{} cells lie outside the fixed window", outside),
                    ));
                }
                rect
            }
        };

        let mut members: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, t) in image.cell_type.iter().enumerate() {
            members.entry(t.clone()).or_default().push(i);
        }

        let intensity = params.sigma.map(|sigma| {
            let mut res = vec![0.0; image.len()];
            for idx in members.values() {
                let lambda = leave_one_out_intensity(&image.x, &image.y, idx, sigma, &window);
                for (&i, l) in idx.iter().zip(lambda) {
                    res[i] = l;
                }
            }
            res
        });

        Ok(Self {
            index: NeighbourIndex::build(&image.x, &image.y, max_radius),
            x: image.x.clone(),
            y: image.y.clone(),
            window,
            members,
            intensity,
            edge_correction: params.edge_correction,
            min_cells: params.min_cells.max(1),
        })
    }

    /// Number of cells of a type
    pub fn count(&self, cell_type: &str) -> usize {
        self.members.get(cell_type).map_or(0, |m| m.len())
    }

    /// Sorted indices of all cells belonging to any of the types
    pub fn members_of(&self, cell_types: &[String]) -> Vec<usize> {
        let mut res: Vec<usize> = cell_types
            .iter()
            .filter_map(|t| self.members.get(t))
            .flatten()
            .copied()
            .collect();
        res.sort_unstable();
        res.dedup();
        res
    }

    /// Is a count large enough for the statistic to be defined
    pub fn is_sufficient(&self, n: usize) -> bool {
        n >= self.min_cells
    }

    /// Check that the radii can be answered by the neighbour index
    pub(crate) fn check_radii(&self, radii: &[f64]) -> Result<()> {
        let max_r = validate_radii(radii)?;
        if max_r > self.index.max_radius() {
            return Err(SpatialError::InvalidConfig(format!(
                "Radius {} exceeds the prepared maximum radius {}",
                max_r,
                self.index.max_radius()
            )));
        }
        Ok(())
    }

    /// L-function of one ordered pair of cell types
    ///
    /// Uses the inhomogeneous K-function when a kernel bandwidth was
    /// supplied.
    ///
    /// ### Params
    ///
    /// * `from` - The focal cell type
    /// * `to` - The neighbouring cell type
    /// * `radii` - The radii to evaluate
    ///
    /// ### Returns
    ///
    /// The `LCurve`, or `None` if either type has fewer than `min_cells`
    /// cells.
    pub fn l_curve(&self, from: &str, to: &str, radii: &[f64]) -> Result<Option<LCurve>> {
        self.check_radii(radii)?;
        let from_idx = self.members_of(&[from.to_string()]);
        let to_idx = self.members_of(&[to.to_string()]);
        if !self.is_sufficient(from_idx.len()) || !self.is_sufficient(to_idx.len()) {
            return Ok(None);
        }

        let observed = match &self.intensity {
            Some(lambda) => self.inhomogeneous_l(&from_idx, &to_idx, lambda, radii),
            None => self.homogeneous_l(&from_idx, &to_idx, radii),
        };

        Ok(observed.map(|observed| LCurve {
            radii: radii.to_vec(),
            observed,
            theoretical: radii.to_vec(),
            n_from: from_idx.len(),
            n_to: to_idx.len(),
        }))
    }

    /// Homogeneous L-function between two sets of cells
    ///
    /// ### Params
    ///
    /// * `from` - Sorted indices of the focal cells
    /// * `to` - Sorted indices of the neighbouring cells
    /// * `radii` - The radii; must have passed `check_radii`
    ///
    /// ### Returns
    ///
    /// The observed L per radius, `None` if no pairs of distinct cells exist.
    pub(crate) fn homogeneous_l(&self, from: &[usize], to: &[usize], radii: &[f64]) -> Option<Vec<f64>> {
        let n_shared = count_shared(from, to);
        let n_pairs = (from.len() * to.len()).checked_sub(n_shared)?;
        if n_pairs == 0 {
            return None;
        }
        let unit = vec![1.0; self.x.len()];
        let sums = self.weighted_pair_sums(from, to, &unit, radii);
        let scale = self.window.area() / n_pairs as f64;
        Some(sums.iter().map(|s| k_to_l(s * scale)).collect())
    }

    /// Inhomogeneous L-function between two sets of cells
    fn inhomogeneous_l(
        &self,
        from: &[usize],
        to: &[usize],
        lambda: &[f64],
        radii: &[f64],
    ) -> Option<Vec<f64>> {
        let inv: Vec<f64> = lambda.iter().map(|l| 1.0 / l).collect();
        let sum_from: f64 = from.iter().map(|&i| inv[i]).sum();
        let sum_to: f64 = to.iter().map(|&j| inv[j]).sum();
        let shared: f64 = shared_indices(from, to).map(|i| inv[i] * inv[i]).sum();
        let denom = (sum_from * sum_to - shared) / self.window.area();
        if !(denom.is_finite() && denom > 0.0) {
            return None;
        }
        let sums = self.weighted_pair_sums(from, to, &inv, radii);
        Some(sums.iter().map(|s| k_to_l(s / denom)).collect())
    }

    /// Sum of `w_i * w_j * e_ij` over ordered pairs of distinct cells within
    /// each radius
    ///
    /// Pairs are accumulated in a fixed order (focal index, then distance) so
    /// the result does not depend on thread scheduling.
    fn weighted_pair_sums(&self, from: &[usize], to: &[usize], w: &[f64], radii: &[f64]) -> Vec<f64> {
        let mut is_to = vec![false; self.x.len()];
        for &j in to {
            is_to[j] = true;
        }

        let mut order: Vec<usize> = (0..radii.len()).collect();
        order.sort_by(|&a, &b| radii[a].total_cmp(&radii[b]));
        let sorted: Vec<f64> = order.iter().map(|&k| radii[k]).collect();
        let max_r = sorted[sorted.len() - 1];

        // pair contributions binned at the smallest radius covering them
        let mut bins = vec![0.0; sorted.len()];
        for &i in from {
            let centre = (self.x[i], self.y[i]);
            for &(j, d) in self.index.within(i, max_r) {
                if !is_to[j] {
                    continue;
                }
                let e = self
                    .window
                    .edge_weight(self.edge_correction, centre, (self.x[j], self.y[j]), d);
                let bin = sorted.partition_point(|&r| r < d);
                bins[bin] += w[i] * w[j] * e;
            }
        }

        let mut res = vec![0.0; radii.len()];
        let mut running = 0.0;
        for (pos, &k) in order.iter().enumerate() {
            running += bins[pos];
            res[k] = running;
        }
        res
    }
}

/// Variance stabilising transform of K
fn k_to_l(k: f64) -> f64 {
    (k.max(0.0) / PI).sqrt()
}

/// Indices present in both sorted index vectors
fn shared_indices<'a>(a: &'a [usize], b: &'a [usize]) -> impl Iterator<Item = usize> + 'a {
    a.iter().copied().filter(move |i| b.binary_search(i).is_ok())
}

fn count_shared(a: &[usize], b: &[usize]) -> usize {
    shared_indices(a, b).count()
}

/// Point pattern statistic for one image and one ordered pair of cell types
///
/// ### Params
///
/// * `image` - The cells of the image
/// * `from` - The focal cell type
/// * `to` - The neighbouring cell type (may equal `from`)
/// * `radii` - The radii to evaluate
/// * `params` - The point pattern parameters
///
/// ### Returns
///
/// The `LCurve` (use `deviation()` per radius or `summary()`), or `None` if
/// either type has fewer than `min_cells` cells.
pub fn point_pattern_statistic(
    image: &ImageCells,
    from: &str,
    to: &str,
    radii: &[f64],
    params: &PointPatternParams,
) -> Result<Option<LCurve>> {
    let max_r = validate_radii(radii)?;
    let pattern = ImagePattern::new(image, params, max_r)?;
    pattern.l_curve(from, to, radii)
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn window(size: f64) -> Rect {
        Rect::new(0.0, size, 0.0, size).unwrap()
    }

    fn fixed(size: f64) -> PointPatternParams {
        PointPatternParams {
            window: WindowKind::Fixed(window(size)),
            ..PointPatternParams::default()
        }
    }

    #[test]
    fn test_null_calibration() {
        let rect = window(1000.0);
        let mut rng = StdRng::seed_from_u64(42);
        let mut values = Vec::new();
        for i in 0..40 {
            let image = SyntheticImage::new(&format!("img_{}", i))
                .add("A", &homogeneous_poisson(2e-4, &rect, &mut rng))
                .add("B", &homogeneous_poisson(2e-4, &rect, &mut rng))
                .into_image();
            let curve = point_pattern_statistic(&image, "A", "B", &[50.0], &fixed(1000.0))
                .unwrap()
                .unwrap();
            values.push(curve.summary());
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        assert!(mean.abs() < 3.0, "mean deviation under CSR was {}", mean);
    }

    #[test]
    fn test_translation_null_calibration() {
        let rect = window(1000.0);
        let params = PointPatternParams {
            edge_correction: EdgeCorrection::Translation,
            ..fixed(1000.0)
        };
        let radii = [25.0, 50.0];
        let mut rng = StdRng::seed_from_u64(43);
        let mut values = Vec::new();
        for i in 0..40 {
            let image = SyntheticImage::new(&format!("img_{}", i))
                .add("A", &homogeneous_poisson(2e-4, &rect, &mut rng))
                .add("B", &homogeneous_poisson(2e-4, &rect, &mut rng))
                .into_image();
            let pattern = ImagePattern::new(&image, &params, 50.0).unwrap();
            let curve = pattern.l_curve("A", "B", &radii).unwrap().unwrap();
            assert_eq!(curve.theoretical, radii.to_vec());
            assert!(curve.observed.iter().all(|l| l.is_finite() && *l >= 0.0));
            values.push(curve.summary());
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        assert!(mean.abs() < 3.0, "mean deviation under CSR was {}", mean);
    }

    #[test]
    fn test_monotone_detection() {
        let rect = window(1000.0);
        let radii: Vec<f64> = (1..=10).map(|i| i as f64 * 5.0).collect();
        let mut summaries = Vec::new();
        for planting in [40.0, 20.0, 5.0] {
            let mut rng = StdRng::seed_from_u64(7);
            let anchors = uniform_points(50, &rect, &mut rng);
            let planted = planted_points(&anchors, 2, planting, &rect, &mut rng);
            let image = SyntheticImage::new("img")
                .add("A", &anchors)
                .add("B", &planted)
                .into_image();
            let curve = point_pattern_statistic(&image, "A", "B", &radii, &fixed(1000.0))
                .unwrap()
                .unwrap();
            summaries.push(curve.summary());
        }
        assert!(summaries[0] > 0.0);
        assert!(summaries[0] < summaries[1]);
        assert!(summaries[1] < summaries[2]);
    }

    #[test]
    fn test_repulsion_is_negative() {
        let rect = window(1000.0);
        let mut rng = StdRng::seed_from_u64(11);
        let anchors = uniform_points(50, &rect, &mut rng);
        let repelled = repelled_points(&anchors, 200, 60.0, &rect, &mut rng);
        let image = SyntheticImage::new("img")
            .add("A", &anchors)
            .add("B", &repelled)
            .into_image();
        let curve = point_pattern_statistic(&image, "A", "B", &[25.0, 50.0], &fixed(1000.0))
            .unwrap()
            .unwrap();
        assert!(curve.observed.iter().all(|l| *l == 0.0));
        assert!((curve.summary() + 37.5).abs() < 1e-9);
    }

    #[test]
    fn test_missing_type_is_none() {
        let rect = window(100.0);
        let mut rng = StdRng::seed_from_u64(3);
        let image = SyntheticImage::new("img")
            .add("A", &uniform_points(30, &rect, &mut rng))
            .into_image();
        let res = point_pattern_statistic(&image, "A", "B", &[10.0], &fixed(100.0)).unwrap();
        assert!(res.is_none());
        let res = point_pattern_statistic(&image, "A", "A", &[10.0], &fixed(100.0)).unwrap();
        assert!(res.is_some());
    }

    #[test]
    fn test_homogeneous_k_by_hand() {
        // two cells of A and one of B, no edge correction
        let params = PointPatternParams {
            window: WindowKind::Fixed(window(10.0)),
            edge_correction: EdgeCorrection::None,
            min_cells: 1,
            sigma: None,
        };
        let image = SyntheticImage::new("img")
            .add("A", &[(5.0, 5.0), (1.0, 1.0)])
            .add("B", &[(5.0, 6.0)])
            .into_image();
        let curve = point_pattern_statistic(&image, "A", "B", &[2.0], &params)
            .unwrap()
            .unwrap();
        // K = 100 * 1 / 2
        assert!((curve.observed[0] - (50.0 / PI).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_radius_order_is_preserved() {
        let rect = window(200.0);
        let mut rng = StdRng::seed_from_u64(5);
        let image = SyntheticImage::new("img")
            .add("A", &uniform_points(60, &rect, &mut rng))
            .add("B", &uniform_points(60, &rect, &mut rng))
            .into_image();
        let up = point_pattern_statistic(&image, "A", "B", &[10.0, 20.0], &fixed(200.0))
            .unwrap()
            .unwrap();
        let down = point_pattern_statistic(&image, "A", "B", &[20.0, 10.0], &fixed(200.0))
            .unwrap()
            .unwrap();
        assert_eq!(up.observed[0], down.observed[1]);
        assert_eq!(up.observed[1], down.observed[0]);
    }

    #[test]
    fn test_inhomogeneous_absorbs_shared_density() {
        // both types four times denser on the left half
        let left = Rect::new(0.0, 500.0, 0.0, 1000.0).unwrap();
        let right = Rect::new(500.0, 1000.0, 0.0, 1000.0).unwrap();
        let mut rng = StdRng::seed_from_u64(21);
        let mut a = uniform_points(1200, &left, &mut rng);
        a.extend(uniform_points(300, &right, &mut rng));
        let mut b = uniform_points(1200, &left, &mut rng);
        b.extend(uniform_points(300, &right, &mut rng));
        let image = SyntheticImage::new("img").add("A", &a).add("B", &b).into_image();

        let homogeneous = point_pattern_statistic(&image, "A", "B", &[50.0], &fixed(1000.0))
            .unwrap()
            .unwrap()
            .summary();
        let params = PointPatternParams {
            sigma: Some(100.0),
            ..fixed(1000.0)
        };
        let inhomogeneous = point_pattern_statistic(&image, "A", "B", &[50.0], &params)
            .unwrap()
            .unwrap()
            .summary();
        assert!(homogeneous > 5.0);
        assert!(inhomogeneous.abs() < homogeneous / 2.0);
    }

    #[test]
    fn test_nan_coordinates_are_input_errors() {
        let image = SyntheticImage::new("bad")
            .add("A", &[(f64::NAN, 1.0), (2.0, 2.0)])
            .into_image();
        let err = point_pattern_statistic(&image, "A", "A", &[1.0], &PointPatternParams::default())
            .unwrap_err();
        assert_eq!(err.kind(), "InputDataError");
    }
}
