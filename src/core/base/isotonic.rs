use crate::assert_same_len;

/// Direction of the monotone constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Monotonicity {
    /// Fitted values never decrease with x
    Increasing,
    /// Fitted values never increase with x
    Decreasing,
}

/// A fitted isotonic step function
///
/// ### Fields
///
/// * `x` - The sorted, unique predictor values
/// * `fitted` - The fitted (monotone) response at each of `x`
#[derive(Debug, Clone)]
pub struct IsotonicFit {
    pub x: Vec<f64>,
    pub fitted: Vec<f64>,
}

impl IsotonicFit {
    /// Predict at a new x
    ///
    /// Linear interpolation between the knots; constant beyond the range.
    ///
    /// ### Params
    ///
    /// * `x` - The predictor value
    ///
    /// ### Returns
    ///
    /// The predicted value
    pub fn predict(&self, x: f64) -> f64 {
        let n = self.x.len();
        if n == 0 {
            return f64::NAN;
        }
        if x <= self.x[0] {
            return self.fitted[0];
        }
        if x >= self.x[n - 1] {
            return self.fitted[n - 1];
        }
        let pos = self.x.partition_point(|&knot| knot <= x);
        let (x0, x1) = (self.x[pos - 1], self.x[pos]);
        let (y0, y1) = (self.fitted[pos - 1], self.fitted[pos]);
        y0 + (y1 - y0) * (x - x0) / (x1 - x0)
    }
}

/// Weighted isotonic regression via pool adjacent violators
///
/// Observations with tied x are pooled first, so the fit is a function of x.
/// Non-finite observations and non-positive weights are ignored.
///
/// ### Params
///
/// * `x` - Predictor values
/// * `y` - Response values
/// * `w` - Observation weights
/// * `direction` - Monotone direction of the fit
///
/// ### Returns
///
/// The `IsotonicFit` (empty if no valid observations remain).
pub fn isotonic_regression(x: &[f64], y: &[f64], w: &[f64], direction: Monotonicity) -> IsotonicFit {
    assert_same_len!(x, y, w);

    let mut points: Vec<(f64, f64, f64)> = x
        .iter()
        .zip(y.iter())
        .zip(w.iter())
        .filter(|((x, y), w)| x.is_finite() && y.is_finite() && w.is_finite() && **w > 0.0)
        .map(|((&x, &y), &w)| (x, y, w))
        .collect();
    points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    // pool ties in x; blocks hold (x, weighted mean, total weight, n knots)
    let sign = match direction {
        Monotonicity::Increasing => 1.0,
        Monotonicity::Decreasing => -1.0,
    };
    let mut knots: Vec<(f64, f64, f64)> = Vec::with_capacity(points.len());
    for (px, py, pw) in points {
        match knots.last_mut() {
            Some(last) if last.0 == px => {
                let total = last.2 + pw;
                last.1 = (last.1 * last.2 + sign * py * pw) / total;
                last.2 = total;
            }
            _ => knots.push((px, sign * py, pw)),
        }
    }

    // blocks: (value, weight, number of knots covered)
    let mut blocks: Vec<(f64, f64, usize)> = Vec::with_capacity(knots.len());
    for &(_, value, weight) in &knots {
        blocks.push((value, weight, 1));
        while blocks.len() > 1 {
            let len = blocks.len();
            let (v_prev, w_prev, n_prev) = blocks[len - 2];
            let (v_last, w_last, n_last) = blocks[len - 1];
            if v_prev <= v_last {
                break;
            }
            let total = w_prev + w_last;
            blocks.truncate(len - 2);
            blocks.push((
                (v_prev * w_prev + v_last * w_last) / total,
                total,
                n_prev + n_last,
            ));
        }
    }

    let fitted: Vec<f64> = blocks
        .iter()
        .flat_map(|&(value, _, n)| std::iter::repeat(sign * value).take(n))
        .collect();

    IsotonicFit {
        x: knots.iter().map(|k| k.0).collect(),
        fitted,
    }
}

///////////
// Tests //
///////////
