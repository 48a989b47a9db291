use extendr_api::prelude::*;
use faer::Mat;

use crate::core::data::cells::MarkerProfiles;
use crate::core::hierarchy::builder::*;
use crate::core::hierarchy::cell_types::{parent_combinations, CellTypeHierarchy};
use crate::core::spatial::kontextual::kontextual;
use crate::core::spatial::point_pattern::{point_pattern_statistic, PointPatternParams};
use crate::core::spatial::window::{parse_edge_correction, Rect, WindowKind};
use crate::utils::r_rust_interface::*;

impl PointPatternParams {
    /// Generate the point pattern parameters from an R list
    ///
    /// ### Params
    ///
    /// * `r_list` - The R list containing the parameters. `window` is either
    ///   missing (bounding box) or `c(xmin, xmax, ymin, ymax)`.
    ///
    /// ### Returns
    ///
    /// The `PointPatternParams` structure based on the R list
    pub fn from_r_list(r_list: List) -> extendr_api::Result<Self> {
        let params = r_list.into_hashmap();
        let default = PointPatternParams::default();

        let window = match params.get("window").and_then(|v| v.as_real_vector()) {
            Some(w) if w.len() == 4 => {
                WindowKind::Fixed(Rect::new(w[0], w[1], w[2], w[3]).map_err(to_r_error)?)
            }
            Some(_) => return Err(Error::Other("window must have four values".to_string())),
            None => default.window,
        };
        let edge_correction = match params.get("edge_correction").and_then(|v| v.as_str()) {
            Some(s) => parse_edge_correction(s)
                .ok_or_else(|| format!("Invalid edge correction: {}", s))?,
            None => default.edge_correction,
        };
        let min_cells = params
            .get("min_cells")
            .and_then(|v| v.as_integer())
            .map_or(default.min_cells, |v| v.max(1) as usize);
        let sigma = params.get("sigma").and_then(|v| v.as_real());

        Ok(PointPatternParams {
            window,
            edge_correction,
            min_cells,
            sigma,
        })
    }
}

impl HierarchyParams {
    /// Generate the hierarchy parameters from an R list
    pub fn from_r_list(r_list: List) -> extendr_api::Result<Self> {
        let params = r_list.into_hashmap();
        let default = HierarchyParams::default();

        let distance = match params.get("distance").and_then(|v| v.as_str()) {
            Some(s) => parse_linkage_distance(s).ok_or_else(|| format!("Invalid distance: {}", s))?,
            None => default.distance,
        };
        let scale = params
            .get("scale")
            .and_then(|v| v.as_bool())
            .unwrap_or(default.scale);
        let cut = match (
            params.get("k").and_then(|v| v.as_integer()),
            params.get("height").and_then(|v| v.as_real()),
        ) {
            (Some(k), _) => TreeCut::Clusters(k.max(1) as usize),
            (None, Some(h)) => TreeCut::Height(h),
            (None, None) => default.cut,
        };

        Ok(HierarchyParams {
            distance,
            scale,
            cut,
        })
    }
}

/// Point pattern co-localisation statistic
///
/// @description Calculates the deviation of the Besag L-function from
/// complete spatial randomness between two cell types of one image.
///
/// @param cell_type Character vector. Cell type per cell.
/// @param x,y Numeric vectors. Cell coordinates.
/// @param from String. The focal cell type.
/// @param to String. The neighbouring cell type.
/// @param radii Numeric vector. The radii to evaluate.
/// @param params List with the point pattern parameters: `window`,
/// `edge_correction`, `min_cells` and `sigma`.
///
/// @return A list with the following items:
/// \itemize{
///  \item radii - The radii
///  \item observed - The observed L-function
///  \item theoretical - The L-function under randomness
///  \item summary - Mean deviation over the radii
/// }
/// The statistics are `NULL` if either cell type has too few cells.
///
/// @export
#[extendr]
fn rs_point_pattern(
    cell_type: Vec<String>,
    x: Vec<f64>,
    y: Vec<f64>,
    from: &str,
    to: &str,
    radii: &[f64],
    params: List,
) -> extendr_api::Result<List> {
    let params = PointPatternParams::from_r_list(params)?;
    let image = r_image_cells("image", cell_type, x, y)?;
    let curve = point_pattern_statistic(&image, from, to, radii, &params).map_err(to_r_error)?;

    Ok(match curve {
        Some(curve) => {
            let summary = curve.summary();
            list!(
                radii = curve.radii,
                observed = curve.observed,
                theoretical = curve.theoretical,
                summary = summary
            )
        }
        None => list!(
            radii = radii.to_vec(),
            observed = r!(NULL),
            theoretical = r!(NULL),
            summary = r!(NULL)
        ),
    })
}

/// Contextual co-localisation statistic
///
/// @description Calculates the Kontextual statistic of `from` to `to`
/// relative to the parent population of `to`, alongside the original
/// L-function deviation.
///
/// @param cell_type Character vector. Cell type per cell.
/// @param x,y Numeric vectors. Cell coordinates.
/// @param from String. The focal cell type.
/// @param to String. The neighbouring cell type.
/// @param parent Character vector. The cell types of the parent population,
/// must contain `to`.
/// @param radii Numeric vector. The radii to evaluate.
/// @param params List with the point pattern parameters.
///
/// @return A list with `radii`, `original` and `kontextual`; both are NULL
/// if counts are too low.
///
/// @export
#[extendr]
#[allow(clippy::too_many_arguments)]
fn rs_kontextual(
    cell_type: Vec<String>,
    x: Vec<f64>,
    y: Vec<f64>,
    from: &str,
    to: &str,
    parent: Vec<String>,
    radii: &[f64],
    params: List,
) -> extendr_api::Result<List> {
    let params = PointPatternParams::from_r_list(params)?;
    let image = r_image_cells("image", cell_type, x, y)?;
    let res = kontextual(&image, from, to, &parent, radii, &params).map_err(to_r_error)?;

    Ok(match res {
        Some(res) => list!(
            radii = res.radii,
            original = res.original,
            kontextual = res.kontextual
        ),
        None => list!(
            radii = radii.to_vec(),
            original = r!(NULL),
            kontextual = r!(NULL)
        ),
    })
}

/// Enumerate the contextual queries of a hierarchy
///
/// @param all_types Character vector. All cell types.
/// @param parents Named list of character vectors. Children per parent.
///
/// @return A list with `from`, `to`, `parent`, `column` and `failures`, the
/// messages of the cell types that were skipped.
///
/// @export
#[extendr]
fn rs_parent_combinations(all_types: Vec<String>, parents: List) -> extendr_api::Result<List> {
    let parents = r_list_to_btree_map(parents)?;
    let hierarchy = CellTypeHierarchy::new(parents, &all_types).map_err(to_r_error)?;
    let res = parent_combinations(&all_types, &hierarchy);
    let failures: Vec<String> = res.failures.iter().map(|e| e.to_string()).collect();
    let combos = res.combinations;

    let column: Vec<String> = combos.iter().map(|c| c.column_name()).collect();
    let from: Vec<String> = combos.iter().map(|c| c.from.clone()).collect();
    let to: Vec<String> = combos.iter().map(|c| c.to.clone()).collect();
    let parent: Vec<String> = combos.into_iter().map(|c| c.parent).collect();

    Ok(list!(
        from = from,
        to = to,
        parent = parent,
        column = column,
        failures = failures
    ))
}

/// Build a cell type hierarchy from marker profiles
///
/// @param profiles Numeric matrix. Cell types x markers mean intensities.
/// @param cell_types Character vector. The row names of `profiles`.
/// @param params List with `distance`, `scale` and either `k` or `height`.
///
/// @return A named list with the children of every parent.
///
/// @export
#[extendr]
fn rs_build_hierarchy(
    profiles: RMatrix<f64>,
    cell_types: Vec<String>,
    params: List,
) -> extendr_api::Result<List> {
    let params = HierarchyParams::from_r_list(params)?;
    let means: Mat<f64> = r_matrix_to_owned(&profiles);
    let profiles = MarkerProfiles {
        markers: (0..means.ncols()).map(|j| format!("marker_{}", j)).collect(),
        cell_types,
        means,
    };
    let hierarchy = build_hierarchy(&profiles, &params).map_err(to_r_error)?;

    let names: Vec<String> = hierarchy.parent_names().cloned().collect();
    let members: Vec<Robj> = names
        .iter()
        .map(|p| {
            let children: Vec<String> = hierarchy
                .children(p)
                .map(|c| c.iter().cloned().collect())
                .unwrap_or_default();
            Robj::from(children)
        })
        .collect();
    let mut result_list = List::from_values(members);
    result_list.set_names(names)?;
    Ok(result_list)
}

extendr_module! {
    mod r_spatial;
    fn rs_point_pattern;
    fn rs_kontextual;
    fn rs_parent_combinations;
    fn rs_build_hierarchy;
}
