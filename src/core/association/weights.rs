use serde::{Deserialize, Serialize};

use crate::core::association::table::{AssociationTable, CountTable};
use crate::core::base::isotonic::{isotonic_regression, IsotonicFit, Monotonicity};
use crate::core::base::stats::median;
use crate::error::{Result, SpatialError};

/// Floor of the fitted variance relative to its mean within a column
const VARIANCE_FLOOR: f64 = 1e-3;

/// Minimum number of observations for a per pair fit
const MIN_PER_PAIR: usize = 3;

/// Scope of the variance curve
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightMode {
    /// One curve across all columns
    Global,
    /// One curve per column
    PerPair,
}

/// Parsing the weight mode
///
/// ### Params
///
/// * `s` - string defining the mode
///
/// ### Returns
///
/// The `WeightMode`.
pub fn parse_weight_mode(s: &str) -> Option<WeightMode> {
    match s.to_lowercase().as_str() {
        "global" => Some(WeightMode::Global),
        "per_pair" | "perpair" | "pair" => Some(WeightMode::PerPair),
        _ => None,
    }
}

/// Parameters of the image weighting
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WeightParams {
    pub mode: WeightMode,
}

impl Default for WeightParams {
    fn default() -> Self {
        Self {
            mode: WeightMode::Global,
        }
    }
}

/// Per entry weights aligned with an `AssociationTable`
///
/// ### Fields
///
/// * `row_ids` - As in the table
/// * `columns` - As in the table
/// * `weights` - Row major weights; `None` where the value is missing
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WeightTable {
    pub row_ids: Vec<String>,
    pub columns: Vec<String>,
    pub weights: Vec<Vec<Option<f64>>>,
}

impl WeightTable {
    /// Weight of one entry
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        self.weights[row][col]
    }
}

/// One observation of the variance curve: (log10 count, squared deviation)
struct VariancePoint {
    row: usize,
    log_count: f64,
    sq_dev: f64,
}

/// Squared deviations from the column median
fn column_points(table: &AssociationTable, counts: &CountTable, col: usize) -> Vec<VariancePoint> {
    let present: Vec<f64> = table.column_values(col).into_iter().flatten().collect();
    let Some(centre) = median(&present) else {
        return Vec::new();
    };
    (0..table.nrows())
        .filter_map(|row| {
            let value = table.get(row, col)?;
            let n = counts.min_count(row, col);
            (n > 0).then(|| VariancePoint {
                row,
                log_count: (n as f64).log10(),
                sq_dev: (value - centre).powi(2),
            })
        })
        .collect()
}

fn fit_curve(points: &[&VariancePoint]) -> IsotonicFit {
    let x: Vec<f64> = points.iter().map(|p| p.log_count).collect();
    let y: Vec<f64> = points.iter().map(|p| p.sq_dev).collect();
    let w = vec![1.0; points.len()];
    isotonic_regression(&x, &y, &w, Monotonicity::Decreasing)
}

/// Inverse variance weights of one column, normalised to mean one
fn column_weights(points: &[VariancePoint], curve: Option<&IsotonicFit>, nrows: usize) -> Vec<Option<f64>> {
    let mut res = vec![None; nrows];
    if points.is_empty() {
        return res;
    }

    let fitted: Vec<f64> = match curve {
        Some(curve) => points.iter().map(|p| curve.predict(p.log_count)).collect(),
        None => vec![1.0; points.len()],
    };
    let mean_var = fitted.iter().sum::<f64>() / fitted.len() as f64;
    let raw: Vec<f64> = if mean_var.is_finite() && mean_var > 0.0 {
        let floor = VARIANCE_FLOOR * mean_var;
        fitted.iter().map(|v| 1.0 / v.max(floor)).collect()
    } else {
        vec![1.0; points.len()]
    };

    let mean_w = raw.iter().sum::<f64>() / raw.len() as f64;
    for (p, w) in points.iter().zip(raw) {
        res[p.row] = Some(w / mean_w);
    }
    res
}

/// Fit per image weights from cell counts
///
/// The squared deviation of every value from its column median is regressed
/// on `log10` of the count of the rarer cell type with a decreasing isotonic
/// fit. The weight of an entry is the inverse of the fitted variance at its
/// count, normalised to mean one within the column.
///
/// ### Params
///
/// * `table` - The association table
/// * `counts` - The matching cell counts
/// * `params` - The weighting parameters
///
/// ### Returns
///
/// The `WeightTable`, or `InvalidConfig` if table and counts do not align.
pub fn fit_weights(table: &AssociationTable, counts: &CountTable, params: &WeightParams) -> Result<WeightTable> {
    if table.row_ids != counts.row_ids || table.columns != counts.columns {
        return Err(SpatialError::InvalidConfig(
            "Association table and count table are not aligned".to_string(),
        ));
    }

    let per_column: Vec<Vec<VariancePoint>> = (0..table.ncols())
        .map(|col| column_points(table, counts, col))
        .collect();

    let global_curve = match params.mode {
        WeightMode::Global => {
            let all: Vec<&VariancePoint> = per_column.iter().flatten().collect();
            Some(fit_curve(&all))
        }
        WeightMode::PerPair => None,
    };

    let by_column: Vec<Vec<Option<f64>>> = per_column
        .iter()
        .map(|points| match params.mode {
            WeightMode::Global => column_weights(points, global_curve.as_ref(), table.nrows()),
            WeightMode::PerPair => {
                if points.len() < MIN_PER_PAIR {
                    column_weights(points, None, table.nrows())
                } else {
                    let refs: Vec<&VariancePoint> = points.iter().collect();
                    column_weights(points, Some(&fit_curve(&refs)), table.nrows())
                }
            }
        })
        .collect();

    let weights = (0..table.nrows())
        .map(|row| by_column.iter().map(|col| col[row]).collect())
        .collect();

    Ok(WeightTable {
        row_ids: table.row_ids.clone(),
        columns: table.columns.clone(),
        weights,
    })
}

///////////
// Tests //
///////////
