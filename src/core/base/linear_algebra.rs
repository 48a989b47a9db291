use faer::{linalg::solvers::DenseSolveCore, Mat, MatRef};

use crate::assert_same_len;

/// Threshold on the determinant of the correlation-scaled matrix below which
/// a symmetric positive definite system is treated as singular
const SINGULARITY_TOL: f64 = 1e-10;

/// Results of a weighted least squares fit
///
/// ### Fields
///
/// * `coefficients` - The fitted coefficients (one per design column)
/// * `std_errors` - Standard errors of the coefficients
/// * `sigma2` - Residual variance estimate
/// * `df_resid` - Residual degrees of freedom
#[derive(Debug, Clone)]
pub struct WlsFit {
    pub coefficients: Vec<f64>,
    pub std_errors: Vec<f64>,
    pub sigma2: f64,
    pub df_resid: usize,
}

/// Invert a symmetric positive definite matrix
///
/// The matrix is first scaled to unit diagonal; if the determinant of the
/// scaled matrix indicates (near) singularity, `None` is returned.
///
/// ### Params
///
/// * `mat` - The symmetric positive definite matrix
///
/// ### Returns
///
/// The inverse, or `None` if the matrix is singular.
pub fn invert_spd(mat: MatRef<f64>) -> Option<Mat<f64>> {
    let p = mat.nrows();
    if p == 0 || p != mat.ncols() {
        return None;
    }
    let scale: Vec<f64> = (0..p).map(|i| mat[(i, i)]).collect();
    if scale.iter().any(|&d| !(d.is_finite() && d > 0.0)) {
        return None;
    }
    let scaled = Mat::from_fn(p, p, |i, j| mat[(i, j)] / (scale[i] * scale[j]).sqrt());
    let det = scaled.determinant();
    if !det.is_finite() || det < SINGULARITY_TOL {
        return None;
    }

    let lu = scaled.partial_piv_lu();
    let inv_scaled = lu.inverse();
    let inv = Mat::from_fn(p, p, |i, j| inv_scaled[(i, j)] / (scale[i] * scale[j]).sqrt());

    if (0..p).all(|i| inv[(i, i)].is_finite() && inv[(i, i)] > 0.0) {
        Some(inv)
    } else {
        None
    }
}

/// Log determinant of a symmetric positive definite matrix
///
/// ### Params
///
/// * `mat` - The matrix
///
/// ### Returns
///
/// The log determinant, `None` if not positive definite.
pub fn log_det_spd(mat: MatRef<f64>) -> Option<f64> {
    let det = mat.to_owned().determinant();
    if det.is_finite() && det > 0.0 {
        Some(det.ln())
    } else {
        None
    }
}

/// Computes `X' W X` and `X' W y`
///
/// ### Params
///
/// * `x` - Design matrix (observations x predictors)
/// * `y` - Response vector
/// * `w` - Observation weights
///
/// ### Returns
///
/// Tuple of the cross product matrix and the right hand side
pub fn weighted_cross_products(x: MatRef<f64>, y: &[f64], w: &[f64]) -> (Mat<f64>, Vec<f64>) {
    assert_same_len!(y, w);
    assert_eq!(x.nrows(), y.len(), "Design matrix and response differ in rows");

    let xw = Mat::from_fn(x.nrows(), x.ncols(), |i, j| x[(i, j)] * w[i]);
    let y = Mat::from_fn(y.len(), 1, |i, _| y[i]);

    let xtwx = xw.transpose() * x;
    let xtwy = xw.transpose() * y.as_ref();

    (xtwx, (0..xtwy.nrows()).map(|i| xtwy[(i, 0)]).collect())
}

/// Multiply a matrix with a vector
pub fn mat_vec(mat: MatRef<f64>, v: &[f64]) -> Vec<f64> {
    assert_eq!(mat.ncols(), v.len(), "Matrix and vector do not conform");
    let v = Mat::from_fn(v.len(), 1, |i, _| v[i]);
    let res = mat * v.as_ref();

    (0..res.nrows()).map(|i| res[(i, 0)]).collect()
}

/// Weighted least squares
///
/// Fits `y = X b` minimising `sum(w * (y - X b)^2)`. The weights act as
/// precision weights (as in `lm(weights = w)`).
///
/// ### Params
///
/// * `x` - Design matrix (observations x predictors), including the
///   intercept column if one is wanted
/// * `y` - Response vector
/// * `w` - Non-negative observation weights
///
/// ### Returns
///
/// The `WlsFit`, or `None` if the design is singular or there are no
/// residual degrees of freedom.
pub fn weighted_least_squares(x: MatRef<f64>, y: &[f64], w: &[f64]) -> Option<WlsFit> {
    let n = x.nrows();
    let p = x.ncols();
    if n <= p {
        return None;
    }

    let (xtwx, xtwy) = weighted_cross_products(x, y, w);
    let inv = invert_spd(xtwx.as_ref())?;
    let coefficients = mat_vec(inv.as_ref(), &xtwy);

    let fitted = mat_vec(x, &coefficients);
    let rss: f64 = (0..n).map(|obs| w[obs] * (y[obs] - fitted[obs]).powi(2)).sum();
    let df_resid = n - p;
    let sigma2 = rss / df_resid as f64;

    let std_errors = (0..p).map(|j| (sigma2 * inv[(j, j)]).sqrt()).collect();

    Some(WlsFit {
        coefficients,
        std_errors,
        sigma2,
        df_resid,
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invert_spd() {
        let m = Mat::from_fn(2, 2, |i, j| [[4.0, 2.0], [2.0, 3.0]][i][j]);
        let inv = invert_spd(m.as_ref()).unwrap();
        // inverse = 1/8 * [[3, -2], [-2, 4]]
        assert!((inv[(0, 0)] - 0.375).abs() < 1e-10);
        assert!((inv[(0, 1)] + 0.25).abs() < 1e-10);
        assert!((inv[(1, 1)] - 0.5).abs() < 1e-10);
    }

    #[test]
    fn test_invert_singular() {
        let m = Mat::from_fn(2, 2, |i, j| [[1.0, 2.0], [2.0, 4.0]][i][j]);
        assert!(invert_spd(m.as_ref()).is_none());
    }

    #[test]
    fn test_weighted_cross_products() {
        let x = Mat::from_fn(3, 2, |i, j| [[1.0, 0.0], [1.0, 1.0], [1.0, 2.0]][i][j]);
        let (xtwx, xtwy) = weighted_cross_products(x.as_ref(), &[1.0, 2.0, 3.0], &[1.0, 2.0, 0.5]);
        // sum(w) = 3.5, sum(w x) = 3, sum(w x^2) = 4
        assert!((xtwx[(0, 0)] - 3.5).abs() < 1e-12);
        assert!((xtwx[(0, 1)] - 3.0).abs() < 1e-12);
        assert!((xtwx[(1, 0)] - 3.0).abs() < 1e-12);
        assert!((xtwx[(1, 1)] - 4.0).abs() < 1e-12);
        // sum(w y) = 6.5, sum(w x y) = 7
        assert!((xtwy[0] - 6.5).abs() < 1e-12);
        assert!((xtwy[1] - 7.0).abs() < 1e-12);
        assert_eq!(mat_vec(x.as_ref(), &[1.0, 2.0]), vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn test_ols_matches_closed_form() {
        // y = 1 + 2x with known residuals
        let xs = [0.0, 1.0, 2.0, 3.0, 4.0];
        let ys = [1.1, 2.9, 5.2, 6.8, 9.0];
        let x = Mat::from_fn(5, 2, |i, j| if j == 0 { 1.0 } else { xs[i] });
        let fit = weighted_least_squares(x.as_ref(), &ys, &[1.0; 5]).unwrap();
        // lm(y ~ x): intercept 1.06, slope 1.97
        assert!((fit.coefficients[0] - 1.06).abs() < 1e-10);
        assert!((fit.coefficients[1] - 1.97).abs() < 1e-10);
        assert_eq!(fit.df_resid, 3);
        assert!(fit.std_errors.iter().all(|s| *s > 0.0));
    }

    #[test]
    fn test_wls_zero_weight_drops_point() {
        let xs = [0.0, 1.0, 2.0, 3.0];
        let ys = [0.0, 1.0, 2.0, 100.0];
        let x = Mat::from_fn(4, 2, |i, j| if j == 0 { 1.0 } else { xs[i] });
        let fit = weighted_least_squares(x.as_ref(), &ys, &[1.0, 1.0, 1.0, 0.0]).unwrap();
        assert!((fit.coefficients[1] - 1.0).abs() < 1e-10);
        assert!(fit.coefficients[0].abs() < 1e-10);
    }
}
