use extendr_api::prelude::*;
use extendr_api::CanBeNA;
use std::collections::BTreeMap;

use crate::core::association::outcome::*;
use crate::core::association::table::*;
use crate::core::association::weights::{fit_weights, parse_weight_mode, WeightParams, WeightTable};
use crate::core::base::stats::calc_fdr;
use crate::core::hierarchy::cell_types::ParentSpec;
use crate::core::spatial::point_pattern::PointPatternParams;
use crate::utils::r_rust_interface::*;

/////////////
// Helpers //
/////////////

/// Row major optional values into an R matrix with NA
fn options_to_r_matrix(values: &[Vec<Option<f64>>], ncol: usize) -> RArray<f64, [usize; 2]> {
    RArray::new_matrix(values.len(), ncol, |row, col| {
        values[row][col].unwrap_or(<f64 as CanBeNA>::na())
    })
}

/// R matrix with NA into row major optional values
fn r_matrix_to_options(x: &RMatrix<f64>) -> Vec<Vec<Option<f64>>> {
    let mat = r_matrix_to_faer(x);
    (0..mat.nrows())
        .map(|i| {
            (0..mat.ncols())
                .map(|j| Some(mat[(i, j)]).filter(|v| v.is_finite()))
                .collect()
        })
        .collect()
}

/// Read an outcome of the given type from R
fn r_outcome(outcome: Robj, outcome_type: &str, reference: Option<String>) -> extendr_api::Result<Outcome> {
    match outcome_type.to_lowercase().as_str() {
        "categorical" => Ok(Outcome::Categorical {
            values: r_named_str_vec(outcome)?,
            reference,
        }),
        "continuous" => Ok(Outcome::Continuous(r_named_num_vec(outcome)?)),
        "survival" => {
            let parts = outcome
                .as_list()
                .ok_or_else(|| Error::Other("Survival outcome must be a list".to_string()))?
                .into_hashmap();
            let time = parts
                .get("time")
                .and_then(|v| v.as_real_vector())
                .ok_or_else(|| Error::Other("Survival outcome needs numeric 'time'".to_string()))?;
            let event = parts
                .get("event")
                .and_then(|v| v.as_logical_vector())
                .ok_or_else(|| Error::Other("Survival outcome needs logical 'event'".to_string()))?;
            let names: Vec<String> = parts
                .get("time")
                .and_then(|v| v.names())
                .map(|n| n.map(|s| s.to_string()).collect())
                .ok_or_else(|| Error::Other("'time' must be named".to_string()))?;
            if time.len() != event.len() {
                return Err(Error::Other("time and event differ in length".to_string()));
            }
            let values = names
                .into_iter()
                .zip(time.into_iter().zip(event))
                .map(|(id, (time, event))| {
                    (
                        id,
                        SurvivalTime {
                            time,
                            event: event.is_true(),
                        },
                    )
                })
                .collect();
            Ok(Outcome::Survival(values))
        }
        _ => Err(Error::Other(format!("Invalid outcome type: {}", outcome_type))),
    }
}

///////////////
// Functions //
///////////////

/// Image by pair association table
///
/// @description Calculates the co-localisation statistic for every image and
/// pair. Pairs with a parent use the contextual statistic.
///
/// @param cells List with `image_id`, `cell_type`, `x`, `y` and optionally
/// `cell_id` and `subject_id`.
/// @param from,to Character vectors. The pairs.
/// @param parent Character vector. Parent name per pair; `""` for none.
/// @param parents Named list of character vectors. Cell types per parent.
/// @param radii Numeric vector. The radii; values are averaged over them.
/// @param params List with the point pattern parameters.
/// @param weight_mode Optional string. `"global"` or `"per_pair"`; if given
/// the image weights are returned as well.
/// @param n_threads Integer. Number of threads, `0L` for all cores.
///
/// @return A list with the following items:
/// \itemize{
///  \item values - Images x columns matrix with NA for missing values
///  \item weights - Matching weights, NULL unless a weight mode was given
///  \item row_ids - The images
///  \item columns - The columns
///  \item failures - List with `kind`, `image_id`, `column` and `message`
/// }
///
/// @export
#[extendr]
#[allow(clippy::too_many_arguments)]
fn rs_association_table(
    cells: List,
    from: Vec<String>,
    to: Vec<String>,
    parent: Vec<String>,
    parents: List,
    radii: &[f64],
    params: List,
    weight_mode: Option<String>,
    n_threads: usize,
) -> extendr_api::Result<List> {
    if from.len() != to.len() || from.len() != parent.len() {
        return Err(Error::Other("from, to and parent must have the same length".to_string()));
    }
    let cells = r_list_to_cell_table(cells)?;
    let parents = r_list_to_btree_map(parents)?;
    let params = PointPatternParams::from_r_list(params)?;
    let batch_params = BatchParams {
        n_threads,
        ..BatchParams::default()
    };

    let mut pairs = Vec::with_capacity(from.len());
    for ((f, t), p) in from.iter().zip(to.iter()).zip(parent.iter()) {
        if p.is_empty() {
            pairs.push(PairSpec::new(f, t));
            continue;
        }
        let types = parents
            .get(p)
            .ok_or_else(|| Error::Other(format!("Unknown parent: {}", p)))?;
        let mut types = types.clone();
        types.sort();
        types.dedup();
        pairs.push(PairSpec::contextual(
            f,
            t,
            ParentSpec {
                name: p.clone(),
                types,
            },
        ));
    }

    let batch = build_association_table(&cells, &pairs, radii, &params, &batch_params).map_err(to_r_error)?;

    let weights: Option<WeightTable> = match weight_mode {
        Some(mode) => {
            let mode = parse_weight_mode(&mode).ok_or_else(|| format!("Invalid weight mode: {}", mode))?;
            Some(fit_weights(&batch.table, &batch.counts, &WeightParams { mode }).map_err(to_r_error)?)
        }
        None => None,
    };

    let ncol = batch.table.ncols();
    let values = options_to_r_matrix(&batch.table.values, ncol);
    let weights: Robj = match weights {
        Some(w) => options_to_r_matrix(&w.weights, ncol).into(),
        None => r!(NULL),
    };

    let failures = list!(
        kind = batch.failures.iter().map(|f| f.kind.clone()).collect::<Vec<_>>(),
        image_id = batch
            .failures
            .iter()
            .map(|f| f.image_id.clone().unwrap_or_default())
            .collect::<Vec<_>>(),
        column = batch
            .failures
            .iter()
            .map(|f| f.column.clone().unwrap_or_default())
            .collect::<Vec<_>>(),
        message = batch.failures.iter().map(|f| f.error.to_string()).collect::<Vec<_>>()
    );

    Ok(list!(
        values = values,
        weights = weights,
        row_ids = batch.table.row_ids,
        columns = batch.table.columns,
        failures = failures
    ))
}

/// Associate the association table with an outcome
///
/// @description Fits one model per column: weighted least squares or a random
/// intercept mixed model for categorical and continuous outcomes, a Cox model
/// for survival outcomes.
///
/// @param values Numeric matrix. Images x columns with NA for missing values.
/// @param row_ids Character vector. The images.
/// @param columns Character vector. The columns.
/// @param outcome The outcome: a named character vector (categorical), a
/// named numeric vector (continuous) or a list with a named numeric `time`
/// and a logical `event` (survival).
/// @param outcome_type String. One of `"categorical"`, `"continuous"` or
/// `"survival"`.
/// @param reference Optional string. Reference level of a categorical
/// outcome.
/// @param weights Optional numeric matrix aligned with `values`.
/// @param subjects Optional named character vector mapping images to
/// subjects.
/// @param min_observations Integer. Minimum number of complete rows.
///
/// @return A list with `column`, `term`, `coefficient`, `std_error`,
/// `statistic`, `p_value`, `fdr`, `hazard_ratio`, `n_obs` and `error`,
/// ranked by significance.
///
/// @export
#[extendr]
#[allow(clippy::too_many_arguments)]
fn rs_outcome_association(
    values: RMatrix<f64>,
    row_ids: Vec<String>,
    columns: Vec<String>,
    outcome: Robj,
    outcome_type: &str,
    reference: Option<String>,
    weights: Robj,
    subjects: Robj,
    min_observations: usize,
) -> extendr_api::Result<List> {
    if values.nrows() != row_ids.len() || values.ncols() != columns.len() {
        return Err(Error::Other("values do not match row_ids and columns".to_string()));
    }
    let table = AssociationTable {
        row_ids: row_ids.clone(),
        subjects: None,
        columns: columns.clone(),
        values: r_matrix_to_options(&values),
    };
    let weights = if weights.is_null() {
        None
    } else {
        let w = RMatrix::<f64>::try_from(weights)?;
        Some(WeightTable {
            row_ids,
            columns,
            weights: r_matrix_to_options(&w),
        })
    };
    let subjects: Option<BTreeMap<String, String>> = if subjects.is_null() {
        None
    } else {
        Some(r_named_str_vec(subjects)?)
    };
    let outcome = r_outcome(outcome, outcome_type, reference)?;
    let params = OutcomeParams {
        min_observations,
        ..OutcomeParams::default()
    };

    let res = fit_outcome_association(
        &table,
        &outcome,
        weights.as_ref(),
        subjects.as_ref(),
        None,
        &params,
    )
    .map_err(to_r_error)?;

    Ok(list!(
        column = res.iter().map(|r| r.column.clone()).collect::<Vec<_>>(),
        term = res.iter().map(|r| r.term.clone()).collect::<Vec<_>>(),
        coefficient = res.iter().map(|r| r.coefficient).collect::<Vec<_>>(),
        std_error = res.iter().map(|r| r.std_error).collect::<Vec<_>>(),
        statistic = res.iter().map(|r| r.statistic).collect::<Vec<_>>(),
        p_value = res.iter().map(|r| r.p_value).collect::<Vec<_>>(),
        fdr = res.iter().map(|r| r.fdr).collect::<Vec<_>>(),
        hazard_ratio = res.iter().map(|r| r.hazard_ratio).collect::<Vec<_>>(),
        n_obs = res.iter().map(|r| r.n_obs as i32).collect::<Vec<_>>(),
        error = res
            .iter()
            .map(|r| r.error.as_ref().map(|e| e.to_string()).unwrap_or_default())
            .collect::<Vec<_>>()
    ))
}

/// Calculate the FDR
///
/// @description Benjamini-Hochberg adjustment of p-values.
///
/// @param pvals Numeric vector. The p-values.
///
/// @return The adjusted p-values in the original order.
///
/// @export
#[extendr]
fn rs_fdr_adjustment(pvals: &[f64]) -> Vec<f64> {
    calc_fdr(pvals)
}

extendr_module! {
    mod r_association;
    fn rs_association_table;
    fn rs_outcome_association;
    fn rs_fdr_adjustment;
}
