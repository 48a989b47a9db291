use extendr_api::prelude::*;
use faer::{Mat, MatRef};
use std::collections::BTreeMap;

use crate::core::data::cells::{CellTable, ImageCells};
use crate::error::SpatialError;

/// Turn a crate error into an R error
pub fn to_r_error(err: SpatialError) -> Error {
    Error::Other(format!("{} ({})", err, err.kind()))
}

///////////
// Lists //
///////////

/// Transform a Robj List into a BTreeMap of string vectors
///
/// Used for parent definitions, where the ordering of the keys matters.
pub fn r_list_to_btree_map(r_list: List) -> extendr_api::Result<BTreeMap<String, Vec<String>>> {
    let mut result = BTreeMap::new();
    for (n, s) in r_list {
        let s_vec = s.as_string_vector().ok_or_else(|| {
            Error::Other(format!(
                "Failed to convert value for key '{}' to string vector",
                n
            ))
        })?;
        result.insert(n.to_string(), s_vec);
    }
    Ok(result)
}

/// Get an optional string vector out of an R list
pub fn r_list_get_strings(r_list: &List, key: &str) -> extendr_api::Result<Option<Vec<String>>> {
    let map = r_list.clone().into_hashmap();
    match map.get(key) {
        None => Ok(None),
        Some(obj) if obj.is_null() => Ok(None),
        Some(obj) => obj
            .as_string_vector()
            .map(Some)
            .ok_or_else(|| Error::Other(format!("'{}' must be a character vector", key))),
    }
}

/////////////
// Vectors //
/////////////

/// Get the names and values from a named character vector
pub fn r_named_str_vec(named_vec: Robj) -> extendr_api::Result<BTreeMap<String, String>> {
    let values = named_vec
        .as_string_vector()
        .ok_or_else(|| Error::Other("Expected a character vector".to_string()))?;
    let names = named_vec
        .names()
        .ok_or_else(|| Error::Other("Expected a named vector".to_string()))?;
    Ok(names.map(|s| s.to_string()).zip(values).collect())
}

/// Get the names and values from a named numeric vector
pub fn r_named_num_vec(named_vec: Robj) -> extendr_api::Result<BTreeMap<String, f64>> {
    let values = named_vec
        .as_real_vector()
        .ok_or_else(|| Error::Other("Expected a numeric vector".to_string()))?;
    let names = named_vec
        .names()
        .ok_or_else(|| Error::Other("Expected a named vector".to_string()))?;
    Ok(names.map(|s| s.to_string()).zip(values).collect())
}

///////////
// Cells //
///////////

/// Build the cells of one image from R vectors
pub fn r_image_cells(
    image_id: &str,
    cell_type: Vec<String>,
    x: Vec<f64>,
    y: Vec<f64>,
) -> extendr_api::Result<ImageCells> {
    if cell_type.len() != x.len() || x.len() != y.len() {
        return Err(Error::Other(
            "cell_type, x and y must have the same length".to_string(),
        ));
    }
    Ok(ImageCells {
        image_id: image_id.to_string(),
        subject_ids: None,
        cell_id: (0..x.len()).map(|i| i.to_string()).collect(),
        cell_type,
        x,
        y,
    })
}

/// Build a cell table from an R data frame like list
///
/// Expects `image_id`, `cell_type`, `x` and `y`; `cell_id` and `subject_id`
/// are optional.
pub fn r_list_to_cell_table(r_list: List) -> extendr_api::Result<CellTable> {
    let map = r_list.clone().into_hashmap();
    let strings = |key: &str| -> extendr_api::Result<Vec<String>> {
        map.get(key)
            .and_then(|v| v.as_string_vector())
            .ok_or_else(|| Error::Other(format!("Missing character column '{}'", key)))
    };
    let reals = |key: &str| -> extendr_api::Result<Vec<f64>> {
        map.get(key)
            .and_then(|v| v.as_real_vector())
            .ok_or_else(|| Error::Other(format!("Missing numeric column '{}'", key)))
    };

    let image_id = strings("image_id")?;
    let cell_id = match r_list_get_strings(&r_list, "cell_id")? {
        Some(ids) => ids,
        None => (0..image_id.len()).map(|i| i.to_string()).collect(),
    };
    let table = CellTable::new(cell_id, image_id, strings("cell_type")?, reals("x")?, reals("y")?)
        .map_err(to_r_error)?;
    match r_list_get_strings(&r_list, "subject_id")? {
        Some(subjects) => table.with_subjects(subjects).map_err(to_r_error),
        None => Ok(table),
    }
}

//////////////
// Matrices //
//////////////

/// Transform an R matrix to a Faer one
pub fn r_matrix_to_faer(x: &RMatrix<f64>) -> faer::MatRef<'_, f64> {
    let ncol = x.ncols();
    let nrow = x.nrows();
    let data = x.data();

    MatRef::from_column_major_slice(data, nrow, ncol)
}

/// Copy an R matrix into an owned Faer matrix
pub fn r_matrix_to_owned(x: &RMatrix<f64>) -> Mat<f64> {
    r_matrix_to_faer(x).to_owned()
}
