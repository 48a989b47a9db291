use faer::{Mat, MatRef};

use crate::assert_same_len;
use crate::core::base::linear_algebra::{invert_spd, log_det_spd, mat_vec, weighted_least_squares};

/// Search interval of the log variance ratio in the REML profile
const LOG_RATIO_BOUNDS: (f64, f64) = (-12.0, 8.0);

/// Golden-section iterations of the REML profile
const GOLDEN_ITER: usize = 60;

/// Fitted coefficients of a linear (mixed) model
///
/// ### Fields
///
/// * `coefficients` - Fixed effect estimates
/// * `std_errors` - Standard errors of the estimates
/// * `df` - Degrees of freedom of the t-tests
/// * `sigma2` - Residual variance (scale of unit weight)
/// * `variance_ratio` - Random intercept variance over residual variance
///   (`None` for plain least squares)
#[derive(Debug, Clone)]
pub struct LinearFit {
    pub coefficients: Vec<f64>,
    pub std_errors: Vec<f64>,
    pub df: f64,
    pub sigma2: f64,
    pub variance_ratio: Option<f64>,
}

/// Weighted least squares fit
///
/// ### Params
///
/// * `x` - Design matrix including the intercept
/// * `y` - Response
/// * `w` - Precision weights
///
/// ### Returns
///
/// The `LinearFit` with `n - p` degrees of freedom, `None` if not estimable.
pub fn fit_linear(x: MatRef<f64>, y: &[f64], w: &[f64]) -> Option<LinearFit> {
    let fit = weighted_least_squares(x, y, w)?;
    if !(fit.sigma2.is_finite() && fit.sigma2 > 0.0) {
        return None;
    }
    Some(LinearFit {
        coefficients: fit.coefficients,
        std_errors: fit.std_errors,
        df: fit.df_resid as f64,
        sigma2: fit.sigma2,
        variance_ratio: None,
    })
}

/// Pieces of the GLS system for one value of the variance ratio
struct GlsSystem {
    xtvx: Mat<f64>,
    xtvy: Vec<f64>,
    log_det_v: f64,
}

/// Computes `X' H^-1 X`, `X' H^-1 y` and `log|H|`
///
/// `H = diag(1 / w) + lambda * Z Z'` with `Z` the subject indicator; every
/// subject block is inverted with the Sherman-Morrison formula.
fn gls_system(x: MatRef<f64>, y: &[f64], w: &[f64], groups: &[Vec<usize>], lambda: f64) -> GlsSystem {
    let p = x.ncols();
    let mut xtvx = Mat::<f64>::zeros(p, p);
    let mut xtvy = vec![0.0; p];
    let mut log_det_v = 0.0;

    for rows in groups {
        let sum_w: f64 = rows.iter().map(|&i| w[i]).sum();
        let shrink = lambda / (1.0 + lambda * sum_w);
        log_det_v += rows.iter().map(|&i| -w[i].ln()).sum::<f64>() + (1.0 + lambda * sum_w).ln();

        // weighted column sums of the block
        let wx: Vec<f64> = (0..p).map(|a| rows.iter().map(|&i| w[i] * x[(i, a)]).sum()).collect();
        let wy: f64 = rows.iter().map(|&i| w[i] * y[i]).sum();

        for a in 0..p {
            xtvy[a] += rows.iter().map(|&i| w[i] * x[(i, a)] * y[i]).sum::<f64>() - shrink * wx[a] * wy;
            for b in 0..p {
                xtvx[(a, b)] +=
                    rows.iter().map(|&i| w[i] * x[(i, a)] * x[(i, b)]).sum::<f64>() - shrink * wx[a] * wx[b];
            }
        }
    }

    GlsSystem {
        xtvx,
        xtvy,
        log_det_v,
    }
}

/// `r' H^-1 r` for residuals `r`
fn quadratic_form(r: &[f64], w: &[f64], groups: &[Vec<usize>], lambda: f64) -> f64 {
    groups
        .iter()
        .map(|rows| {
            let sum_w: f64 = rows.iter().map(|&i| w[i]).sum();
            let wr: f64 = rows.iter().map(|&i| w[i] * r[i]).sum();
            let direct: f64 = rows.iter().map(|&i| w[i] * r[i] * r[i]).sum();
            direct - lambda / (1.0 + lambda * sum_w) * wr * wr
        })
        .sum()
}

/// Generalised least squares for a fixed variance ratio
///
/// ### Returns
///
/// Tuple of (coefficients, inverse of `X' H^-1 X`, `sigma2`, profiled
/// negative REML log likelihood)
fn profile_fit(
    x: MatRef<f64>,
    y: &[f64],
    w: &[f64],
    groups: &[Vec<usize>],
    lambda: f64,
) -> Option<(Vec<f64>, Mat<f64>, f64, f64)> {
    let n = y.len();
    let p = x.ncols();
    let system = gls_system(x, y, w, groups, lambda);
    let inv = invert_spd(system.xtvx.as_ref())?;
    let beta = mat_vec(inv.as_ref(), &system.xtvy);

    let resid: Vec<f64> = (0..n)
        .map(|i| y[i] - (0..p).map(|j| x[(i, j)] * beta[j]).sum::<f64>())
        .collect();
    let df = (n - p) as f64;
    let sigma2 = quadratic_form(&resid, w, groups, lambda) / df;
    if !(sigma2.is_finite() && sigma2 > 0.0) {
        return None;
    }
    let log_det_xtvx = log_det_spd(system.xtvx.as_ref())?;
    let neg_reml = 0.5 * (df * sigma2.ln() + system.log_det_v + log_det_xtvx);
    Some((beta, inv, sigma2, neg_reml))
}

/// Random intercept linear mixed model fitted by REML
///
/// `y = X b + u_subject + e` with `Var(e_i) = sigma2 / w_i` and
/// `Var(u) = lambda * sigma2`. The REML criterion is profiled over
/// `sigma2` and minimised over `log(lambda)` by golden-section search;
/// `lambda = 0` is checked as the boundary solution.
///
/// ### Params
///
/// * `x` - Design matrix including the intercept
/// * `y` - Response
/// * `w` - Precision weights
/// * `subjects` - Subject index of every observation
///
/// ### Returns
///
/// The `LinearFit` with `max(n_subjects - p, 1)` degrees of freedom, `None`
/// if not estimable.
pub fn fit_random_intercept(x: MatRef<f64>, y: &[f64], w: &[f64], subjects: &[usize]) -> Option<LinearFit> {
    assert_same_len!(y, w, subjects);
    let n = y.len();
    let p = x.ncols();
    if n <= p || w.iter().any(|wi| !(wi.is_finite() && *wi > 0.0)) {
        return None;
    }

    let n_groups = subjects.iter().max().map_or(0, |m| m + 1);
    let mut groups: Vec<Vec<usize>> = vec![Vec::new(); n_groups];
    for (i, &s) in subjects.iter().enumerate() {
        groups[s].push(i);
    }
    groups.retain(|g| !g.is_empty());

    let objective = |log_lambda: f64| {
        profile_fit(x, y, w, &groups, log_lambda.exp()).map_or(f64::INFINITY, |fit| fit.3)
    };

    // golden-section search on log(lambda)
    let ratio = (5.0_f64.sqrt() - 1.0) / 2.0;
    let (mut lo, mut hi) = LOG_RATIO_BOUNDS;
    let mut c = hi - ratio * (hi - lo);
    let mut d = lo + ratio * (hi - lo);
    let (mut fc, mut fd) = (objective(c), objective(d));
    for _ in 0..GOLDEN_ITER {
        if fc < fd {
            hi = d;
            d = c;
            fd = fc;
            c = hi - ratio * (hi - lo);
            fc = objective(c);
        } else {
            lo = c;
            c = d;
            fc = fd;
            d = lo + ratio * (hi - lo);
            fd = objective(d);
        }
    }
    let interior = ((lo + hi) / 2.0).exp();

    let boundary = profile_fit(x, y, w, &groups, 0.0);
    let candidate = profile_fit(x, y, w, &groups, interior);
    let (lambda, (beta, inv, sigma2, _)) = match (boundary, candidate) {
        (Some(b), Some(c)) => {
            if b.3 <= c.3 {
                (0.0, b)
            } else {
                (interior, c)
            }
        }
        (Some(b), None) => (0.0, b),
        (None, Some(c)) => (interior, c),
        (None, None) => return None,
    };

    let std_errors = (0..p).map(|j| (sigma2 * inv[(j, j)]).sqrt()).collect();
    Some(LinearFit {
        coefficients: beta,
        std_errors,
        df: (groups.len() as f64 - p as f64).max(1.0),
        sigma2,
        variance_ratio: Some(lambda),
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    fn design(group: &[f64]) -> Mat<f64> {
        Mat::from_fn(group.len(), 2, |i, j| if j == 0 { 1.0 } else { group[i] })
    }

    #[test]
    fn test_linear_group_difference() {
        let group = [0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let y = [1.0, 2.0, 3.0, 5.0, 6.0, 7.0];
        let fit = fit_linear(design(&group).as_ref(), &y, &[1.0; 6]).unwrap();
        assert!((fit.coefficients[1] - 4.0).abs() < 1e-10);
        // pooled variance 1, se = sqrt(2/3)
        assert!((fit.std_errors[1] - (2.0_f64 / 3.0).sqrt()).abs() < 1e-10);
        assert_eq!(fit.df, 4.0);
    }

    #[test]
    fn test_mixed_model_without_subject_effect_matches_wls() {
        // one observation per subject: the variance ratio is not identified
        // and the fixed effects equal least squares
        let group = [0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let y = [1.0, 2.5, 3.0, 5.0, 6.0, 7.5];
        let subjects = [0, 1, 2, 3, 4, 5];
        let x = design(&group);
        let lmm = fit_random_intercept(x.as_ref(), &y, &[1.0; 6], &subjects).unwrap();
        let lm = fit_linear(x.as_ref(), &y, &[1.0; 6]).unwrap();
        assert!((lmm.coefficients[1] - lm.coefficients[1]).abs() < 1e-8);
        assert_eq!(lmm.df, 4.0);
    }

    #[test]
    fn test_mixed_model_detects_subject_variance() {
        // strong subject offsets shared by both images of a subject
        let offsets = [-6.0, 4.0, -2.0, 7.0, 0.0, -3.0, 5.0, 1.0];
        let mut group = Vec::new();
        let mut y = Vec::new();
        let mut subjects = Vec::new();
        for (s, off) in offsets.iter().enumerate() {
            let g = if s % 2 == 0 { 0.0 } else { 1.0 };
            for k in 0..2 {
                group.push(g);
                y.push(off + 2.0 * g + if k == 0 { 0.3 } else { -0.3 });
                subjects.push(s);
            }
        }
        let x = design(&group);
        let fit = fit_random_intercept(x.as_ref(), &y, &vec![1.0; y.len()], &subjects).unwrap();
        assert!(fit.variance_ratio.unwrap() > 10.0);
        assert_eq!(fit.df, 6.0);
        assert!(fit.std_errors[1] > 0.0);
    }
}
