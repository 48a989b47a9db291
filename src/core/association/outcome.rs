use faer::Mat;
use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::core::association::cox::fit_cox;
use crate::core::association::lm::{fit_linear, fit_random_intercept, LinearFit};
use crate::core::association::table::AssociationTable;
use crate::core::association::weights::WeightTable;
use crate::core::base::stats::{calc_fdr, t_stat_to_pval, z_score_to_pval, TestAlternative};
use crate::error::{Result, SpatialError};
use crate::utils::general::has_variation;

//////////////////////////////
// ENUMS, TYPES, STRUCTURES //
//////////////////////////////

/// Follow up of one row
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct SurvivalTime {
    pub time: f64,
    pub event: bool,
}

/// The outcome, keyed by row id of the association table
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Group labels; `reference` defaults to the first level in sorted order
    Categorical {
        values: BTreeMap<String, String>,
        reference: Option<String>,
    },
    /// A continuous covariate
    Continuous(BTreeMap<String, f64>),
    /// Time to event
    Survival(BTreeMap<String, SurvivalTime>),
}

/// Additional numeric covariates, keyed by row id
///
/// ### Fields
///
/// * `names` - Covariate names
/// * `values` - One value per covariate for every row id
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Covariates {
    pub names: Vec<String>,
    pub values: BTreeMap<String, Vec<f64>>,
}

/// Parameters of the outcome association
///
/// ### Fields
///
/// * `min_observations` - Minimum number of complete rows per column
/// * `n_threads` - Worker threads for the column fits; `0` uses one per core
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutcomeParams {
    pub min_observations: usize,
    pub n_threads: usize,
}

impl Default for OutcomeParams {
    fn default() -> Self {
        Self {
            min_observations: 3,
            n_threads: 0,
        }
    }
}

/// Which model produced a result
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Weighted least squares
    Linear,
    /// Random intercept linear mixed model
    Mixed,
    /// Cox proportional hazards
    Cox,
    /// Cox proportional hazards with cluster robust variance
    CoxClustered,
}

/// Association of one table column with the outcome
///
/// ### Fields
///
/// * `column` - The table column
/// * `term` - The tested term: the non-reference level for categorical
///   outcomes, `outcome` for continuous and `value` for survival outcomes
/// * `model` - The fitted model
/// * `n_obs` - Number of complete rows
/// * `coefficient` - The estimate
/// * `std_error` - Its standard error
/// * `statistic` - t or z statistic
/// * `p_value` - Raw p-value
/// * `fdr` - Benjamini-Hochberg adjusted p-value
/// * `hazard_ratio` - `exp(coefficient)` for survival outcomes
/// * `error` - Why the column was not estimable
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeModelResult {
    pub column: String,
    pub term: String,
    pub model: ModelKind,
    pub n_obs: usize,
    pub coefficient: Option<f64>,
    pub std_error: Option<f64>,
    pub statistic: Option<f64>,
    pub p_value: Option<f64>,
    pub fdr: Option<f64>,
    pub hazard_ratio: Option<f64>,
    pub error: Option<SpatialError>,
}

impl OutcomeModelResult {
    fn non_estimable(column: &str, term: &str, model: ModelKind, n_obs: usize, reason: &str) -> Self {
        Self {
            column: column.to_string(),
            term: term.to_string(),
            model,
            n_obs,
            coefficient: None,
            std_error: None,
            statistic: None,
            p_value: None,
            fdr: None,
            hazard_ratio: None,
            error: Some(SpatialError::non_estimable(column, reason)),
        }
    }

    pub fn is_estimable(&self) -> bool {
        self.p_value.is_some()
    }
}

/////////////
// Helpers //
/////////////

/// Outcome after resolving the reference level
enum Resolved<'a> {
    Categorical {
        values: &'a BTreeMap<String, String>,
        reference: String,
        levels: Vec<String>,
    },
    Continuous(&'a BTreeMap<String, f64>),
    Survival(&'a BTreeMap<String, SurvivalTime>),
}

fn resolve(outcome: &Outcome) -> Result<Resolved<'_>> {
    match outcome {
        Outcome::Categorical { values, reference } => {
            let levels: BTreeSet<&String> = values.values().collect();
            let reference = match reference {
                Some(r) if levels.contains(r) => r.clone(),
                Some(r) => {
                    return Err(SpatialError::InvalidConfig(format!(
                        "Reference level '{}' does not occur in the outcome",
                        r
                    )))
                }
                None => levels
                    .iter()
                    .next()
                    .map(|l| l.to_string())
                    .ok_or_else(|| SpatialError::InvalidConfig("Outcome has no values".to_string()))?,
            };
            let levels = levels
                .into_iter()
                .filter(|l| **l != reference)
                .cloned()
                .collect();
            Ok(Resolved::Categorical {
                values,
                reference,
                levels,
            })
        }
        Outcome::Continuous(values) => Ok(Resolved::Continuous(values)),
        Outcome::Survival(values) => Ok(Resolved::Survival(values)),
    }
}

impl Resolved<'_> {
    fn terms(&self) -> Vec<String> {
        match self {
            Resolved::Categorical { levels, .. } => levels.clone(),
            Resolved::Continuous(_) => vec!["outcome".to_string()],
            Resolved::Survival(_) => vec!["value".to_string()],
        }
    }

    fn has_row(&self, row_id: &str) -> bool {
        match self {
            Resolved::Categorical { values, .. } => values.contains_key(row_id),
            Resolved::Continuous(values) => values.get(row_id).is_some_and(|v| v.is_finite()),
            Resolved::Survival(values) => values
                .get(row_id)
                .is_some_and(|s| s.time.is_finite() && s.time >= 0.0),
        }
    }
}

/// Complete rows of one column
struct ColumnData {
    row_ids: Vec<String>,
    values: Vec<f64>,
    weights: Vec<f64>,
    covariates: Vec<Vec<f64>>,
    subjects: Option<Vec<usize>>,
}

/// Collect the rows of one column with value, outcome, covariates, weight
/// and (if requested) subject
fn column_data(
    table: &AssociationTable,
    col: usize,
    outcome: &Resolved,
    weights: Option<&WeightTable>,
    subjects: Option<&BTreeMap<String, String>>,
    covariates: Option<&Covariates>,
) -> ColumnData {
    let mut data = ColumnData {
        row_ids: Vec::new(),
        values: Vec::new(),
        weights: Vec::new(),
        covariates: Vec::new(),
        subjects: subjects.map(|_| Vec::new()),
    };
    let mut subject_index: BTreeMap<&str, usize> = BTreeMap::new();

    for (row, row_id) in table.row_ids.iter().enumerate() {
        let Some(value) = table.get(row, col).filter(|v| v.is_finite()) else {
            continue;
        };
        if !outcome.has_row(row_id) {
            continue;
        }
        let weight = match weights {
            Some(w) => match w.get(row, col) {
                Some(wt) if wt.is_finite() && wt > 0.0 => wt,
                _ => continue,
            },
            None => 1.0,
        };
        let covs = match covariates {
            Some(c) => match c.values.get(row_id) {
                Some(v) if v.len() == c.names.len() && v.iter().all(|x| x.is_finite()) => v.clone(),
                _ => continue,
            },
            None => Vec::new(),
        };
        let subject = match subjects {
            Some(map) => match map.get(row_id) {
                Some(s) => {
                    let next = subject_index.len();
                    Some(*subject_index.entry(s.as_str()).or_insert(next))
                }
                None => continue,
            },
            None => None,
        };

        data.row_ids.push(row_id.clone());
        data.values.push(value);
        data.weights.push(weight);
        data.covariates.push(covs);
        if let (Some(list), Some(s)) = (data.subjects.as_mut(), subject) {
            list.push(s);
        }
    }
    data
}

/// Turn a linear fit into one result per tested term
fn linear_results(
    column: &str,
    terms: &[String],
    model: ModelKind,
    n_obs: usize,
    fit: &LinearFit,
) -> Vec<OutcomeModelResult> {
    terms
        .iter()
        .enumerate()
        .map(|(k, term)| {
            let coef = fit.coefficients[k + 1];
            let se = fit.std_errors[k + 1];
            let t = coef / se;
            match t_stat_to_pval(t, fit.df) {
                Some(p) => OutcomeModelResult {
                    column: column.to_string(),
                    term: term.clone(),
                    model,
                    n_obs,
                    coefficient: Some(coef),
                    std_error: Some(se),
                    statistic: Some(t),
                    p_value: Some(p),
                    fdr: None,
                    hazard_ratio: None,
                    error: None,
                },
                None => OutcomeModelResult::non_estimable(column, term, model, n_obs, "undefined test statistic"),
            }
        })
        .collect()
}

/// Fit the model of one column
fn fit_column(
    column: &str,
    data: &ColumnData,
    outcome: &Resolved,
    params: &OutcomeParams,
) -> Vec<OutcomeModelResult> {
    let n = data.values.len();
    let terms = outcome.terms();
    let model = match (outcome, data.subjects.is_some()) {
        (Resolved::Survival(_), true) => ModelKind::CoxClustered,
        (Resolved::Survival(_), false) => ModelKind::Cox,
        (_, true) => ModelKind::Mixed,
        (_, false) => ModelKind::Linear,
    };
    let fail = |reason: &str| -> Vec<OutcomeModelResult> {
        debug!("Column {} is not estimable: {}", column, reason);
        terms
            .iter()
            .map(|t| OutcomeModelResult::non_estimable(column, t, model, n, reason))
            .collect()
    };

    if n < params.min_observations.max(1) {
        return fail(&format!("{} complete observations, {} required", n, params.min_observations));
    }
    if !has_variation(&data.values) {
        return fail("no variation in the statistic");
    }
    let n_cov = data.covariates.first().map_or(0, |c| c.len());

    match outcome {
        Resolved::Survival(values) => {
            let time: Vec<f64> = data.row_ids.iter().map(|r| values[r].time).collect();
            let event: Vec<bool> = data.row_ids.iter().map(|r| values[r].event).collect();
            if !event.iter().any(|e| *e) {
                return fail("no events");
            }
            let x = Mat::from_fn(n, 1 + n_cov, |i, j| {
                if j == 0 {
                    data.values[i]
                } else {
                    data.covariates[i][j - 1]
                }
            });
            let Some(fit) = fit_cox(&time, &event, x.as_ref(), &data.weights, data.subjects.as_deref()) else {
                return fail("Cox model did not converge or has a singular information matrix");
            };
            let (coef, se) = (fit.coefficients[0], fit.std_errors[0]);
            if !(se.is_finite() && se > 0.0) {
                return fail("undefined standard error");
            }
            let z = coef / se;
            vec![OutcomeModelResult {
                column: column.to_string(),
                term: terms[0].clone(),
                model,
                n_obs: n,
                coefficient: Some(coef),
                std_error: Some(se),
                statistic: Some(z),
                p_value: Some(z_score_to_pval(z, TestAlternative::TwoSided)),
                fdr: None,
                hazard_ratio: Some(coef.exp()),
                error: None,
            }]
        }
        Resolved::Categorical {
            values,
            reference,
            levels,
        } => {
            let labels: Vec<&String> = data.row_ids.iter().map(|r| &values[r]).collect();
            if !labels.iter().any(|l| *l == reference) {
                return fail("reference level not observed");
            }
            if labels.iter().all(|l| *l == reference) {
                return fail("no variation in the outcome");
            }
            let present: BTreeSet<&String> = labels.iter().copied().collect();
            if levels.iter().any(|l| !present.contains(l)) {
                return fail("an outcome level is not observed");
            }
            let p = 1 + levels.len() + n_cov;
            let x = Mat::from_fn(n, p, |i, j| {
                if j == 0 {
                    1.0
                } else if j <= levels.len() {
                    if *labels[i] == levels[j - 1] {
                        1.0
                    } else {
                        0.0
                    }
                } else {
                    data.covariates[i][j - 1 - levels.len()]
                }
            });
            fit_linear_model(column, &terms, model, data, x)
                .unwrap_or_else(|| fail("singular design or no residual degrees of freedom"))
        }
        Resolved::Continuous(values) => {
            let predictor: Vec<f64> = data.row_ids.iter().map(|r| values[r]).collect();
            if !has_variation(&predictor) {
                return fail("no variation in the outcome");
            }
            let x = Mat::from_fn(n, 2 + n_cov, |i, j| match j {
                0 => 1.0,
                1 => predictor[i],
                _ => data.covariates[i][j - 2],
            });
            fit_linear_model(column, &terms, model, data, x)
                .unwrap_or_else(|| fail("singular design or no residual degrees of freedom"))
        }
    }
}

fn fit_linear_model(
    column: &str,
    terms: &[String],
    model: ModelKind,
    data: &ColumnData,
    x: Mat<f64>,
) -> Option<Vec<OutcomeModelResult>> {
    let fit = match &data.subjects {
        Some(subjects) => fit_random_intercept(x.as_ref(), &data.values, &data.weights, subjects)?,
        None => fit_linear(x.as_ref(), &data.values, &data.weights)?,
    };
    Some(linear_results(column, terms, model, data.values.len(), &fit))
}

/// Order results by p-value, then FDR, then column and term; non-estimable
/// results last
fn rank_results(a: &OutcomeModelResult, b: &OutcomeModelResult) -> Ordering {
    let by_option = |x: Option<f64>, y: Option<f64>| match (x, y) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_option(a.p_value, b.p_value)
        .then_with(|| by_option(a.fdr, b.fdr))
        .then_with(|| a.column.cmp(&b.column))
        .then_with(|| a.term.cmp(&b.term))
}

/// Associate every column of the table with an outcome
///
/// Each column is fitted on its own complete rows. Linear outcomes use
/// weighted least squares, or a random intercept mixed model when subjects
/// are given; survival outcomes use a weighted Cox model, with cluster
/// robust errors when subjects are given. Columns that cannot be fitted are
/// reported with a `ModelNonEstimable` error.
///
/// ### Params
///
/// * `table` - The association table
/// * `outcome` - The outcome, keyed by row id
/// * `weights` - Optional weights aligned with the table
/// * `subjects` - Optional row id to subject mapping
/// * `covariates` - Optional additional covariates
/// * `params` - The outcome parameters
///
/// ### Returns
///
/// The results ranked by significance, or `InvalidConfig` for an unusable
/// outcome or misaligned weights.
pub fn fit_outcome_association(
    table: &AssociationTable,
    outcome: &Outcome,
    weights: Option<&WeightTable>,
    subjects: Option<&BTreeMap<String, String>>,
    covariates: Option<&Covariates>,
    params: &OutcomeParams,
) -> Result<Vec<OutcomeModelResult>> {
    let resolved = resolve(outcome)?;
    if let Some(w) = weights {
        if w.row_ids != table.row_ids || w.columns != table.columns {
            return Err(SpatialError::InvalidConfig(
                "Weights are not aligned with the association table".to_string(),
            ));
        }
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(params.n_threads)
        .build()
        .map_err(|e| SpatialError::InvalidConfig(format!("failed to build thread pool: {}", e)))?;

    let nested: Vec<Vec<OutcomeModelResult>> = pool.install(|| {
        (0..table.ncols())
            .into_par_iter()
            .map(|col| {
                let data = column_data(table, col, &resolved, weights, subjects, covariates);
                fit_column(&table.columns[col], &data, &resolved, params)
            })
            .collect()
    });
    let mut results: Vec<OutcomeModelResult> = nested.into_iter().flatten().collect();

    let estimable: Vec<usize> = (0..results.len()).filter(|&i| results[i].is_estimable()).collect();
    let pvals: Vec<f64> = estimable.iter().filter_map(|&i| results[i].p_value).collect();
    for (&i, q) in estimable.iter().zip(calc_fdr(&pvals)) {
        results[i].fdr = Some(q);
    }
    results.sort_by(rank_results);

    info!(
        "Outcome association: {} of {} results estimable",
        estimable.len(),
        results.len()
    );
    Ok(results)
}

///////////
// Tests //
///////////
