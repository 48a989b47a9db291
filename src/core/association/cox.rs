use faer::{Mat, MatRef};

use crate::assert_same_len;
use crate::core::base::linear_algebra::{invert_spd, mat_vec};

/// Maximum Newton-Raphson iterations
const MAX_ITER: usize = 30;

/// Maximum step halvings within one iteration
const MAX_HALVING: usize = 20;

/// Relative change of the log partial likelihood that counts as converged
const TOLERANCE: f64 = 1e-9;

/// Log hazard ratio per standard deviation of a covariate beyond which the
/// likelihood is treated as monotone (infinite coefficient)
const MAX_SCALED_COEF: f64 = 15.0;

/// Fitted Cox proportional hazards model
///
/// ### Fields
///
/// * `coefficients` - Log hazard ratios
/// * `std_errors` - Model based or cluster robust standard errors
/// * `robust` - Were cluster robust standard errors used
/// * `log_likelihood` - Log partial likelihood at the estimate
/// * `iterations` - Newton-Raphson iterations used
#[derive(Debug, Clone)]
pub struct CoxFit {
    pub coefficients: Vec<f64>,
    pub std_errors: Vec<f64>,
    pub robust: bool,
    pub log_likelihood: f64,
    pub iterations: usize,
}

/// Risk set summaries at one distinct event time
struct EventTime {
    time: f64,
    /// Summed weight of the events at this time
    event_weight: f64,
    s0: f64,
    xbar: Vec<f64>,
}

/// Log partial likelihood, score and information (Breslow ties)
struct CoxState {
    log_lik: f64,
    score: Vec<f64>,
    information: Mat<f64>,
    event_times: Vec<EventTime>,
}

/// Evaluate the weighted Breslow partial likelihood
///
/// ### Params
///
/// * `order` - Observation indices sorted by decreasing time
/// * `time` - Follow up times
/// * `event` - Event indicators
/// * `x` - Centred covariates (observations x predictors)
/// * `w` - Case weights
/// * `beta` - Coefficients
fn cox_state(order: &[usize], time: &[f64], event: &[bool], x: MatRef<f64>, w: &[f64], beta: &[f64]) -> CoxState {
    let p = x.ncols();
    let eta = |i: usize| (0..p).map(|j| x[(i, j)] * beta[j]).sum::<f64>();

    let mut s0 = 0.0;
    let mut s1 = vec![0.0; p];
    let mut s2 = Mat::<f64>::zeros(p, p);
    let mut log_lik = 0.0;
    let mut score = vec![0.0; p];
    let mut information = Mat::<f64>::zeros(p, p);
    let mut event_times = Vec::new();

    let mut pos = 0;
    while pos < order.len() {
        let t = time[order[pos]];
        let mut end = pos;
        while end < order.len() && time[order[end]] == t {
            let i = order[end];
            let risk = w[i] * eta(i).exp();
            s0 += risk;
            for a in 0..p {
                s1[a] += risk * x[(i, a)];
                for b in 0..p {
                    s2[(a, b)] += risk * x[(i, a)] * x[(i, b)];
                }
            }
            end += 1;
        }

        let events: Vec<usize> = order[pos..end].iter().copied().filter(|&i| event[i]).collect();
        if !events.is_empty() {
            let xbar: Vec<f64> = s1.iter().map(|v| v / s0).collect();
            let mut event_weight = 0.0;
            for &i in &events {
                event_weight += w[i];
                log_lik += w[i] * (eta(i) - s0.ln());
                for a in 0..p {
                    score[a] += w[i] * (x[(i, a)] - xbar[a]);
                }
            }
            for a in 0..p {
                for b in 0..p {
                    information[(a, b)] += event_weight * (s2[(a, b)] / s0 - xbar[a] * xbar[b]);
                }
            }
            event_times.push(EventTime {
                time: t,
                event_weight,
                s0,
                xbar,
            });
        }
        pos = end;
    }

    CoxState {
        log_lik,
        score,
        information,
        event_times,
    }
}

/// Cluster robust (sandwich) variance of the coefficients
///
/// Uses the weighted score residuals summed within each cluster.
#[allow(clippy::too_many_arguments)]
fn robust_variance(
    state: &CoxState,
    inv_info: MatRef<f64>,
    time: &[f64],
    event: &[bool],
    x: MatRef<f64>,
    w: &[f64],
    beta: &[f64],
    clusters: &[usize],
) -> Mat<f64> {
    let p = x.ncols();
    let n_clusters = clusters.iter().max().map_or(0, |m| m + 1);
    let mut cluster_scores = vec![vec![0.0; p]; n_clusters];

    for i in 0..time.len() {
        let risk = (0..p).map(|j| x[(i, j)] * beta[j]).sum::<f64>().exp();
        let mut resid = vec![0.0; p];
        for et in state.event_times.iter().filter(|et| et.time <= time[i]) {
            let hazard = et.event_weight / et.s0;
            for a in 0..p {
                resid[a] -= risk * hazard * (x[(i, a)] - et.xbar[a]);
            }
            if event[i] && et.time == time[i] {
                for a in 0..p {
                    resid[a] += x[(i, a)] - et.xbar[a];
                }
            }
        }
        for a in 0..p {
            cluster_scores[clusters[i]][a] += w[i] * resid[a];
        }
    }

    let mut meat = Mat::<f64>::zeros(p, p);
    for g in &cluster_scores {
        for a in 0..p {
            for b in 0..p {
                meat[(a, b)] += g[a] * g[b];
            }
        }
    }
    Mat::from_fn(p, p, |a, b| {
        let mut total = 0.0;
        for k in 0..p {
            for l in 0..p {
                total += inv_info[(a, k)] * meat[(k, l)] * inv_info[(l, b)];
            }
        }
        total
    })
}

/// Weighted Cox proportional hazards regression
///
/// Breslow handling of ties; Newton-Raphson with step halving.
///
/// ### Params
///
/// * `time` - Follow up times
/// * `event` - Event indicators
/// * `x` - Covariates (observations x predictors), no intercept
/// * `w` - Case weights
/// * `clusters` - Optional cluster (subject) index per observation; switches
///   to cluster robust standard errors
///
/// ### Returns
///
/// The `CoxFit`, `None` if there are no events, the information matrix is
/// singular or the fit does not converge.
pub fn fit_cox(
    time: &[f64],
    event: &[bool],
    x: MatRef<f64>,
    w: &[f64],
    clusters: Option<&[usize]>,
) -> Option<CoxFit> {
    assert_same_len!(time, event, w);
    let n = time.len();
    let p = x.ncols();
    if n == 0 || p == 0 || !event.iter().any(|e| *e) {
        return None;
    }

    // centring leaves the coefficients unchanged
    let total_w: f64 = w.iter().sum();
    let means: Vec<f64> = (0..p)
        .map(|j| (0..n).map(|i| w[i] * x[(i, j)]).sum::<f64>() / total_w)
        .collect();
    let xc = Mat::from_fn(n, p, |i, j| x[(i, j)] - means[j]);
    let sds: Vec<f64> = (0..p)
        .map(|j| ((0..n).map(|i| w[i] * xc[(i, j)].powi(2)).sum::<f64>() / total_w).sqrt())
        .collect();
    if sds.iter().any(|sd| !(sd.is_finite() && *sd > 0.0)) {
        return None;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| time[b].total_cmp(&time[a]).then(a.cmp(&b)));

    let mut beta = vec![0.0; p];
    let mut state = cox_state(&order, time, event, xc.as_ref(), w, &beta);
    let mut converged = false;
    let mut iterations = 0;

    for iter in 1..=MAX_ITER {
        iterations = iter;
        let inv = invert_spd(state.information.as_ref())?;
        let step = mat_vec(inv.as_ref(), &state.score);

        let mut scale = 1.0;
        let mut accepted = None;
        for _ in 0..MAX_HALVING {
            let candidate: Vec<f64> = beta.iter().zip(step.iter()).map(|(b, s)| b + scale * s).collect();
            let new_state = cox_state(&order, time, event, xc.as_ref(), w, &candidate);
            if new_state.log_lik.is_finite() && new_state.log_lik >= state.log_lik - 1e-12 {
                accepted = Some((candidate, new_state));
                break;
            }
            scale /= 2.0;
        }
        let (candidate, new_state) = accepted?;

        let change = (new_state.log_lik - state.log_lik).abs() / (state.log_lik.abs() + 0.1);
        beta = candidate;
        state = new_state;
        if beta
            .iter()
            .zip(sds.iter())
            .any(|(b, sd)| !b.is_finite() || (b * sd).abs() > MAX_SCALED_COEF)
        {
            return None;
        }
        if change < TOLERANCE {
            converged = true;
            break;
        }
    }
    if !converged {
        return None;
    }

    let inv_info = invert_spd(state.information.as_ref())?;
    let (std_errors, robust) = match clusters {
        Some(clusters) => {
            assert_same_len!(time, clusters);
            let v = robust_variance(&state, inv_info.as_ref(), time, event, xc.as_ref(), w, &beta, clusters);
            ((0..p).map(|j| v[(j, j)].max(0.0).sqrt()).collect(), true)
        }
        None => ((0..p).map(|j| inv_info[(j, j)].sqrt()).collect(), false),
    };

    Some(CoxFit {
        coefficients: beta,
        std_errors,
        robust,
        log_likelihood: state.log_lik,
        iterations,
    })
}

///////////
// Tests //
///////////
