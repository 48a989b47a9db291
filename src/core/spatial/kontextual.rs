use serde::{Deserialize, Serialize};

use crate::core::data::cells::ImageCells;
use crate::core::spatial::point_pattern::{validate_radii, ImagePattern, PointPatternParams};
use crate::error::{Result, SpatialError};

/// Results of a context aware co-localisation query
///
/// ### Fields
///
/// * `from` - The focal cell type
/// * `to` - The neighbouring cell type
/// * `radii` - The evaluated radii
/// * `original` - `L(from, to) - r` per radius
/// * `kontextual` - `L(from, to) - L(from, parent)` per radius
/// * `n_from` - Number of `from` cells
/// * `n_to` - Number of `to` cells
/// * `n_parent` - Number of cells in the parent population
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KontextualRes {
    pub from: String,
    pub to: String,
    pub radii: Vec<f64>,
    pub original: Vec<f64>,
    pub kontextual: Vec<f64>,
    pub n_from: usize,
    pub n_to: usize,
    pub n_parent: usize,
}

impl KontextualRes {
    /// Mean of the original statistic over the radii
    pub fn original_summary(&self) -> f64 {
        self.original.iter().sum::<f64>() / self.original.len() as f64
    }

    /// Mean of the contextual statistic over the radii
    pub fn kontextual_summary(&self) -> f64 {
        self.kontextual.iter().sum::<f64>() / self.kontextual.len() as f64
    }

    /// Do the two statistics point in opposite directions
    pub fn disagrees(&self) -> bool {
        self.original_summary() * self.kontextual_summary() < 0.0
    }
}

/// One point of a contextual curve
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct KontextCurvePoint {
    pub radius: f64,
    pub original: f64,
    pub kontextual: f64,
}

/// Check that the parent population holds the `to` type
pub fn check_parent(from: &str, to: &str, parent: &[String]) -> Result<()> {
    if parent.iter().any(|p| p == to) {
        Ok(())
    } else {
        Err(SpatialError::hierarchy(
            &format!("{}__{}", from, to),
            format!("parent population [{}] does not contain '{}'", parent.join(", "), to),
        ))
    }
}

/// Contextual statistic on a prepared image
///
/// The parent population takes the place of `to` in the null model: the
/// `from` cells are compared against `to` and against the whole parent
/// population with the homogeneous K-function. The kernel bandwidth of the
/// parameters is not used here.
///
/// ### Params
///
/// * `pattern` - The prepared image
/// * `from` - The focal cell type
/// * `to` - The neighbouring cell type; must be part of `parent`
/// * `parent` - Cell types forming the parent population
/// * `radii` - The radii to evaluate
///
/// ### Returns
///
/// The `KontextualRes`, or `None` if `from`, `to` or the parent population
/// is below `min_cells`.
pub fn kontextual_on_pattern(
    pattern: &ImagePattern,
    from: &str,
    to: &str,
    parent: &[String],
    radii: &[f64],
) -> Result<Option<KontextualRes>> {
    check_parent(from, to, parent)?;
    pattern.check_radii(radii)?;

    let from_idx = pattern.members_of(&[from.to_string()]);
    let to_idx = pattern.members_of(&[to.to_string()]);
    let parent_idx = pattern.members_of(parent);

    if !(pattern.is_sufficient(from_idx.len())
        && pattern.is_sufficient(to_idx.len())
        && pattern.is_sufficient(parent_idx.len()))
    {
        return Ok(None);
    }

    let Some(l_to) = pattern.homogeneous_l(&from_idx, &to_idx, radii) else {
        return Ok(None);
    };
    let Some(l_parent) = pattern.homogeneous_l(&from_idx, &parent_idx, radii) else {
        return Ok(None);
    };

    Ok(Some(KontextualRes {
        from: from.to_string(),
        to: to.to_string(),
        radii: radii.to_vec(),
        original: l_to.iter().zip(radii.iter()).map(|(l, r)| l - r).collect(),
        kontextual: l_to.iter().zip(l_parent.iter()).map(|(a, b)| a - b).collect(),
        n_from: from_idx.len(),
        n_to: to_idx.len(),
        n_parent: parent_idx.len(),
    }))
}

/// Context aware co-localisation of two cell types within one image
///
/// ### Params
///
/// * `image` - The cells of the image
/// * `from` - The focal cell type
/// * `to` - The neighbouring cell type; must be part of `parent`
/// * `parent` - Cell types forming the parent population
/// * `radii` - The radii to evaluate
/// * `params` - The point pattern parameters
///
/// ### Returns
///
/// The `KontextualRes` with the original and the contextual statistic per
/// radius, `None` if counts are insufficient. `InvalidHierarchy` if `parent`
/// does not contain `to`.
pub fn kontextual(
    image: &ImageCells,
    from: &str,
    to: &str,
    parent: &[String],
    radii: &[f64],
    params: &PointPatternParams,
) -> Result<Option<KontextualRes>> {
    check_parent(from, to, parent)?;
    let max_r = validate_radii(radii)?;
    let homogeneous = PointPatternParams {
        sigma: None,
        ..params.clone()
    };
    let pattern = ImagePattern::new(image, &homogeneous, max_r)?;
    kontextual_on_pattern(&pattern, from, to, parent, radii)
}

/// Contextual statistic over an ordered sequence of radii
///
/// ### Params
///
/// * `image` - The cells of the image
/// * `from` - The focal cell type
/// * `to` - The neighbouring cell type; must be part of `parent`
/// * `parent` - Cell types forming the parent population
/// * `radii` - The radii, typically increasing
/// * `params` - The point pattern parameters
///
/// ### Returns
///
/// One `KontextCurvePoint` per radius, `None` if counts are insufficient.
pub fn kontext_curve(
    image: &ImageCells,
    from: &str,
    to: &str,
    parent: &[String],
    radii: &[f64],
    params: &PointPatternParams,
) -> Result<Option<Vec<KontextCurvePoint>>> {
    let res = kontextual(image, from, to, parent, radii, params)?;
    Ok(res.map(|res| {
        res.radii
            .iter()
            .zip(res.original.iter().zip(res.kontextual.iter()))
            .map(|(&radius, (&original, &kontextual))| KontextCurvePoint {
                radius,
                original,
                kontextual,
            })
            .collect()
    }))
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::*;
    use crate::core::spatial::window::{Rect, WindowKind};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn compartment_image(seed: u64) -> ImageCells {
        let mut rng = StdRng::seed_from_u64(seed);
        let left = Rect::new(0.0, 500.0, 0.0, 1000.0).unwrap();
        let right = Rect::new(500.0, 1000.0, 0.0, 1000.0).unwrap();
        let immune = uniform_points(200, &left, &mut rng);
        let tumour = uniform_points(600, &right, &mut rng);
        let (near, far): (Vec<(f64, f64)>, Vec<(f64, f64)>) =
            tumour.into_iter().partition(|p| p.0 < 560.0);
        SyntheticImage::new("img")
            .add("Immune", &immune)
            .add("TumourA", &near)
            .add("TumourB", &far)
            .into_image()
    }

    fn params() -> PointPatternParams {
        PointPatternParams {
            window: WindowKind::Fixed(Rect::new(0.0, 1000.0, 0.0, 1000.0).unwrap()),
            ..PointPatternParams::default()
        }
    }

    fn tumour() -> Vec<String> {
        vec!["TumourA".to_string(), "TumourB".to_string()]
    }

    #[test]
    fn test_original_and_contextual_disagree() {
        let image = compartment_image(1);
        let res = kontextual(&image, "Immune", "TumourA", &tumour(), &[50.0], &params())
            .unwrap()
            .unwrap();
        assert!(res.original_summary() < 0.0);
        assert!(res.kontextual_summary() > 0.0);
        assert!(res.disagrees());
        assert_eq!(res.n_parent, 600);
    }

    #[test]
    fn test_parent_without_to_is_invalid() {
        let image = compartment_image(2);
        let parent = vec!["TumourB".to_string()];
        let err = kontextual(&image, "Immune", "TumourA", &parent, &[50.0], &params()).unwrap_err();
        assert_eq!(err.kind(), "InvalidHierarchy");
    }

    #[test]
    fn test_whole_parent_as_to_is_zero() {
        let image = compartment_image(3);
        let mut parent = tumour();
        parent.push("Immune".to_string());
        // when the parent population is just `to`, the contextual value vanishes
        let res = kontextual(
            &image,
            "Immune",
            "TumourA",
            &["TumourA".to_string()],
            &[30.0, 50.0],
            &params(),
        )
        .unwrap()
        .unwrap();
        assert!(res.kontextual.iter().all(|v| v.abs() < 1e-12));
        assert!(kontextual(&image, "Immune", "TumourA", &parent, &[50.0], &params())
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_curve_matches_single_radius_calls() {
        let image = compartment_image(4);
        let radii = [10.0, 20.0, 40.0];
        let curve = kontext_curve(&image, "Immune", "TumourA", &tumour(), &radii, &params())
            .unwrap()
            .unwrap();
        assert_eq!(curve.len(), 3);
        for point in &curve {
            let single = kontextual(&image, "Immune", "TumourA", &tumour(), &[point.radius], &params())
                .unwrap()
                .unwrap();
            assert!((single.kontextual[0] - point.kontextual).abs() < 1e-9);
            assert!((single.original[0] - point.original).abs() < 1e-9);
        }
    }

    #[test]
    fn test_small_parent_is_none() {
        let image = SyntheticImage::new("img")
            .add("A", &[(1.0, 1.0), (2.0, 2.0)])
            .add("B", &[(3.0, 1.0), (4.0, 2.0)])
            .into_image();
        let parent = vec!["B".to_string()];
        let res = kontextual(&image, "A", "B", &parent, &[1.0], &PointPatternParams::default()).unwrap();
        assert!(res.is_none());
    }
}
