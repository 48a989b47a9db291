use rayon::prelude::*;
use statrs::distribution::{Continuous, ContinuousCDF, Normal, StudentsT};
use std::ops::{Add, Div};

/////////////////////
// Enums | Helpers //
/////////////////////

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TestAlternative {
    /// Two sided test
    TwoSided,
    /// One-sided test for greater than
    Greater,
    /// One-sided test for lesser than
    Less,
}

///////////////
// Functions //
///////////////

/// Transform a Z-score into a p-value (assuming normality).
///
/// Uses the Mills ratio approximation in the far tails where the CDF loses
/// precision.
///
/// ### Params
///
/// * `z` - The Z score to transform
/// * `test_alternative` - Which tail(s) to test
///
/// ### Returns
///
/// The p-value
pub fn z_score_to_pval(z: f64, test_alternative: TestAlternative) -> f64 {
    let normal = Normal::standard();
    let upper_tail = |z: f64| -> f64 {
        if z > 6.0 {
            let pdf = normal.pdf(z);
            pdf / z * (1.0 - 1.0 / (z * z))
        } else {
            1.0 - normal.cdf(z)
        }
    };
    match test_alternative {
        TestAlternative::TwoSided => (2.0 * upper_tail(z.abs())).min(1.0),
        TestAlternative::Greater => upper_tail(z),
        TestAlternative::Less => upper_tail(-z),
    }
}

/// Two sided p-value of a t statistic
///
/// ### Params
///
/// * `t` - The t statistic
/// * `df` - Degrees of freedom (must be positive)
///
/// ### Returns
///
/// The two sided p-value, `None` if the degrees of freedom are invalid.
pub fn t_stat_to_pval(t: f64, df: f64) -> Option<f64> {
    if df.is_nan() || df <= 0.0 || !t.is_finite() {
        return None;
    }
    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    Some((2.0 * (1.0 - dist.cdf(t.abs()))).clamp(0.0, 1.0))
}

/// Calculate the FDR
///
/// Benjamini-Hochberg adjustment.
///
/// ### Params
///
/// * `pvals` - P-values for which to calculate the FDR
///
/// ### Returns
///
/// The calculated FDRs
pub fn calc_fdr(pvals: &[f64]) -> Vec<f64> {
    let n = pvals.len();
    if n == 0 {
        return Vec::new();
    }
    let n_f64 = n as f64;

    let mut indexed_pval: Vec<(usize, f64)> =
        pvals.par_iter().enumerate().map(|(i, &x)| (i, x)).collect();

    indexed_pval
        .sort_unstable_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let adj_pvals_tmp: Vec<f64> = indexed_pval
        .par_iter()
        .enumerate()
        .map(|(i, (_, p))| (n_f64 / (i + 1) as f64) * p)
        .collect();

    let mut current_min = adj_pvals_tmp[n - 1].min(1.0);
    let mut monotonic_adj = vec![current_min; n];

    for i in (0..n - 1).rev() {
        current_min = current_min.min(adj_pvals_tmp[i]).min(1.0);
        monotonic_adj[i] = current_min;
    }

    let mut adj_pvals = vec![0.0; n];

    for (i, &(original_idx, _)) in indexed_pval.iter().enumerate() {
        adj_pvals[original_idx] = monotonic_adj[i];
    }

    adj_pvals
}

/// Get the median
///
/// ### Params
///
/// * `x` - The slice for which to calculate the median for.
///
/// ### Results
///
/// The median (if the vector is not empty)
pub fn median<T>(x: &[T]) -> Option<T>
where
    T: Clone + PartialOrd + Add<Output = T> + Div<T, Output = T> + From<u8>,
{
    if x.is_empty() {
        return None;
    }

    let cmp = |a: &T, b: &T| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal);
    let mut data = x.to_vec();
    let len = data.len();

    if len % 2 == 0 {
        let (_, median1, right) = data.select_nth_unstable_by(len / 2 - 1, cmp);
        let median1 = median1.clone();
        let median2 = right.iter().min_by(|a, b| cmp(a, b))?.clone();
        Some((median1 + median2) / T::from(2))
    } else {
        let (_, median, _) = data.select_nth_unstable_by(len / 2, cmp);
        Some(median.clone())
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_z_score_pvals() {
        let p = z_score_to_pval(1.959_963_985, TestAlternative::TwoSided);
        assert!((p - 0.05).abs() < 1e-6);
        let p = z_score_to_pval(1.644_853_627, TestAlternative::Greater);
        assert!((p - 0.05).abs() < 1e-6);
        let p = z_score_to_pval(1.644_853_627, TestAlternative::Less);
        assert!((p - 0.95).abs() < 1e-6);
        // far tail stays positive and tiny
        let p = z_score_to_pval(10.0, TestAlternative::TwoSided);
        assert!(p > 0.0 && p < 1e-20);
    }

    #[test]
    fn test_t_pvals() {
        // qt(0.975, 10) = 2.228139
        let p = t_stat_to_pval(2.228_139, 10.0).unwrap();
        assert!((p - 0.05).abs() < 1e-5);
        assert!(t_stat_to_pval(1.0, 0.0).is_none());
    }

    #[test]
    fn test_fdr() {
        let pvals = vec![0.01, 0.04, 0.03, 0.2];
        let fdr = calc_fdr(&pvals);
        // p.adjust(c(0.01, 0.04, 0.03, 0.2), "BH")
        let expected = [0.04, 0.053_333_33, 0.053_333_33, 0.2];
        for (a, b) in fdr.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
        assert!(calc_fdr(&[]).is_empty());
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median::<f64>(&[]), None);
    }
}
