use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, TAU};

use crate::error::{Result, SpatialError};

/// Lower bound on the fraction of a circle counted as inside the window for
/// the isotropic correction; bounds the weights at 20
const MIN_INSIDE_FRACTION: f64 = 0.05;

///////////
// Enums //
///////////

/// How the observation window of an image is defined
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum WindowKind {
    /// The bounding box of the cell coordinates of the image
    BoundingBox,
    /// A fixed rectangle supplied by the caller (e.g. the image extent)
    Fixed(Rect),
}

/// Edge correction applied to the K-function
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeCorrection {
    /// No correction
    None,
    /// Ohser-Stoyan translation correction
    Translation,
    /// Ripley's isotropic correction
    Isotropic,
}

/// Parse the edge correction
///
/// ### Params
///
/// * `s` - String defining the edge correction
///
/// ### Returns
///
/// Option of the `EdgeCorrection`
pub fn parse_edge_correction(s: &str) -> Option<EdgeCorrection> {
    match s.to_lowercase().as_str() {
        "none" => Some(EdgeCorrection::None),
        "translation" | "translate" => Some(EdgeCorrection::Translation),
        "isotropic" | "ripley" => Some(EdgeCorrection::Isotropic),
        _ => None,
    }
}

//////////
// Rect //
//////////

/// Rectangular observation window
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
}

impl Rect {
    /// Generate a new rectangle
    ///
    /// ### Returns
    ///
    /// The rectangle, or `InvalidConfig` if it has no positive area.
    pub fn new(xmin: f64, xmax: f64, ymin: f64, ymax: f64) -> Result<Self> {
        let rect = Self {
            xmin,
            xmax,
            ymin,
            ymax,
        };
        if rect.area() > 0.0 && rect.area().is_finite() {
            Ok(rect)
        } else {
            Err(SpatialError::InvalidConfig(format!(
                "Window [{}, {}] x [{}, {}] has no positive area",
                xmin, xmax, ymin, ymax
            )))
        }
    }

    /// Bounding box of a set of coordinates
    ///
    /// ### Returns
    ///
    /// The rectangle, `None` if there are no points or the box is
    /// degenerate.
    pub fn bounding_box(x: &[f64], y: &[f64]) -> Option<Self> {
        let fold = |v: &[f64]| {
            v.iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &val| {
                    (lo.min(val), hi.max(val))
                })
        };
        let (xmin, xmax) = fold(x);
        let (ymin, ymax) = fold(y);
        Self::new(xmin, xmax, ymin, ymax).ok()
    }

    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    /// Is the point within the (closed) rectangle
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.xmin && x <= self.xmax && y >= self.ymin && y <= self.ymax
    }

    /// Ripley's isotropic edge correction weight
    ///
    /// Inverse of the fraction of the circle of radius `r` centred at
    /// `(x, y)` that lies within the rectangle. Arcs cut by each side are
    /// summed and the double counted arc near a corner inside the circle is
    /// added back.
    ///
    /// ### Params
    ///
    /// * `x` - x coordinate of the centre
    /// * `y` - y coordinate of the centre
    /// * `r` - Radius of the circle
    ///
    /// ### Returns
    ///
    /// The edge correction weight (≥ 1)
    pub fn isotropic_weight(&self, x: f64, y: f64, r: f64) -> f64 {
        if r <= 0.0 {
            return 1.0;
        }
        // left, bottom, right, top
        let dists = [
            (x - self.xmin).max(0.0),
            (y - self.ymin).max(0.0),
            (self.xmax - x).max(0.0),
            (self.ymax - y).max(0.0),
        ];
        let half_angles: Vec<f64> = dists
            .iter()
            .map(|&d| if d < r { (d / r).acos() } else { 0.0 })
            .collect();

        let mut outside: f64 = half_angles.iter().map(|a| 2.0 * a).sum();
        for k in 0..4 {
            let next = (k + 1) % 4;
            if dists[k].powi(2) + dists[next].powi(2) < r * r {
                outside -= (half_angles[k] + half_angles[next] - FRAC_PI_2).max(0.0);
            }
        }

        let inside = (1.0 - outside / TAU).clamp(MIN_INSIDE_FRACTION, 1.0);
        1.0 / inside
    }

    /// Translation edge correction weight
    ///
    /// `|W| / |W ∩ (W + (dx, dy))|`
    ///
    /// ### Params
    ///
    /// * `dx` - x displacement between the two points
    /// * `dy` - y displacement between the two points
    ///
    /// ### Returns
    ///
    /// The edge correction weight (≥ 1)
    pub fn translation_weight(&self, dx: f64, dy: f64) -> f64 {
        let overlap = (self.width() - dx.abs()).max(0.0) * (self.height() - dy.abs()).max(0.0);
        if overlap <= 0.0 {
            1.0 / MIN_INSIDE_FRACTION
        } else {
            (self.area() / overlap).min(1.0 / MIN_INSIDE_FRACTION)
        }
    }

    /// Edge correction weight for the ordered pair `(i, j)`
    ///
    /// ### Params
    ///
    /// * `correction` - The edge correction to apply
    /// * `from` - Coordinates of the focal point
    /// * `to` - Coordinates of the neighbour
    /// * `dist` - Distance between the two
    ///
    /// ### Returns
    ///
    /// The weight
    pub fn edge_weight(
        &self,
        correction: EdgeCorrection,
        from: (f64, f64),
        to: (f64, f64),
        dist: f64,
    ) -> f64 {
        match correction {
            EdgeCorrection::None => 1.0,
            EdgeCorrection::Translation => self.translation_weight(to.0 - from.0, to.1 - from.1),
            EdgeCorrection::Isotropic => self.isotropic_weight(from.0, from.1, dist),
        }
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Rect {
        Rect::new(0.0, 100.0, 0.0, 100.0).unwrap()
    }

    #[test]
    fn test_degenerate_window() {
        assert!(Rect::new(0.0, 0.0, 0.0, 10.0).is_err());
        assert!(Rect::bounding_box(&[1.0, 1.0], &[0.0, 5.0]).is_none());
        let bb = Rect::bounding_box(&[1.0, 3.0, 2.0], &[0.0, 5.0, 1.0]).unwrap();
        assert_eq!(bb.area(), 10.0);
    }

    #[test]
    fn test_isotropic_interior_point() {
        assert!((square().isotropic_weight(50.0, 50.0, 10.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_isotropic_on_edge_and_corner() {
        // half the circle is outside on a straight edge
        assert!((square().isotropic_weight(0.0, 50.0, 10.0) - 2.0).abs() < 1e-12);
        // three quarters outside in a corner
        assert!((square().isotropic_weight(0.0, 0.0, 10.0) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_isotropic_near_edge() {
        // d = r/2 on one side: outside arc = 2 * acos(0.5) = 2pi/3
        let w = square().isotropic_weight(5.0, 50.0, 10.0);
        assert!((w - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_translation_weight() {
        let w = square().translation_weight(50.0, 0.0);
        assert!((w - 2.0).abs() < 1e-12);
        assert_eq!(square().translation_weight(0.0, 0.0), 1.0);
    }

    #[test]
    fn test_parse_edge_correction() {
        assert_eq!(parse_edge_correction("Isotropic"), Some(EdgeCorrection::Isotropic));
        assert_eq!(parse_edge_correction("translate"), Some(EdgeCorrection::Translation));
        assert_eq!(parse_edge_correction("border"), None);
    }
}
