use faer::Mat;
use rustc_hash::{FxBuildHasher, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use crate::ensure_same_len;
use crate::error::{Result, SpatialError};
use crate::utils::general::unique_sorted;

////////////////
// Structures //
////////////////

/// Column mapping used when reading a cell table from delimited text
///
/// ### Fields
///
/// * `cell_id` - Optional cell identifier column. If absent, the row index
///   within the file is used.
/// * `image_id` - Image identifier column
/// * `subject_id` - Optional subject identifier column (repeated measures)
/// * `cell_type` - Cell type label column
/// * `x` - x coordinate column
/// * `y` - y coordinate column
/// * `delimiter` - Field delimiter
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CellColumns {
    pub cell_id: Option<String>,
    pub image_id: String,
    pub subject_id: Option<String>,
    pub cell_type: String,
    pub x: String,
    pub y: String,
    pub delimiter: u8,
}

impl Default for CellColumns {
    fn default() -> Self {
        Self {
            cell_id: Some("cell_id".to_string()),
            image_id: "image_id".to_string(),
            subject_id: None,
            cell_type: "cell_type".to_string(),
            x: "x".to_string(),
            y: "y".to_string(),
            delimiter: b',',
        }
    }
}

/// A named marker intensity column
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerColumn {
    pub name: String,
    pub values: Vec<f64>,
}

/// Struct-of-arrays cell table across all images
///
/// One row per segmented cell. The table is never mutated by the engine;
/// relabelling of cell types happens upstream.
///
/// ### Fields
///
/// * `cell_id` - Cell identifiers (unique within an image)
/// * `image_id` - Image identifiers
/// * `subject_id` - Optional subject identifiers
/// * `cell_type` - Cell type labels
/// * `x` - x coordinates
/// * `y` - y coordinates
/// * `markers` - Marker intensity columns
#[derive(Debug, Clone, PartialEq)]
pub struct CellTable {
    pub cell_id: Vec<String>,
    pub image_id: Vec<String>,
    pub subject_id: Option<Vec<String>>,
    pub cell_type: Vec<String>,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub markers: Vec<MarkerColumn>,
}

/// Per cell type mean marker expression
///
/// ### Fields
///
/// * `cell_types` - Row names, sorted
/// * `markers` - Column names
/// * `means` - Cell types x markers matrix of mean intensities
#[derive(Debug, Clone)]
pub struct MarkerProfiles {
    pub cell_types: Vec<String>,
    pub markers: Vec<String>,
    pub means: Mat<f64>,
}

/// The cells of a single image
///
/// ### Fields
///
/// * `image_id` - The image identifier
/// * `subject_ids` - Per cell subject identifiers, if present
/// * `cell_id` - Cell identifiers
/// * `cell_type` - Cell type labels
/// * `x` - x coordinates
/// * `y` - y coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct ImageCells {
    pub image_id: String,
    pub subject_ids: Option<Vec<String>>,
    pub cell_id: Vec<String>,
    pub cell_type: Vec<String>,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

///////////////
// CellTable //
///////////////

impl CellTable {
    /// Generate a new cell table
    ///
    /// ### Params
    ///
    /// * `cell_id` - Cell identifiers
    /// * `image_id` - Image identifiers
    /// * `cell_type` - Cell type labels
    /// * `x` - x coordinates
    /// * `y` - y coordinates
    ///
    /// ### Returns
    ///
    /// The table, or `InvalidConfig` if the columns differ in length.
    pub fn new(
        cell_id: Vec<String>,
        image_id: Vec<String>,
        cell_type: Vec<String>,
        x: Vec<f64>,
        y: Vec<f64>,
    ) -> Result<Self> {
        ensure_same_len!(cell_id, image_id, cell_type, x, y);
        Ok(Self {
            cell_id,
            image_id,
            subject_id: None,
            cell_type,
            x,
            y,
            markers: Vec::new(),
        })
    }

    /// Attach subject identifiers
    pub fn with_subjects(mut self, subject_id: Vec<String>) -> Result<Self> {
        ensure_same_len!(self.cell_id, subject_id);
        self.subject_id = Some(subject_id);
        Ok(self)
    }

    /// Attach a marker intensity column
    pub fn with_marker(mut self, name: &str, values: Vec<f64>) -> Result<Self> {
        ensure_same_len!(self.cell_id, values);
        self.markers.push(MarkerColumn {
            name: name.to_string(),
            values,
        });
        Ok(self)
    }

    /// Number of cells
    pub fn len(&self) -> usize {
        self.cell_id.len()
    }

    /// Is the table empty
    pub fn is_empty(&self) -> bool {
        self.cell_id.is_empty()
    }

    /// All cell types in sorted order
    pub fn cell_types(&self) -> Vec<String> {
        unique_sorted(&self.cell_type)
    }

    /// Read a cell table from a delimited text file
    ///
    /// ### Params
    ///
    /// * `path` - Path to the file
    /// * `columns` - The column mapping
    ///
    /// ### Returns
    ///
    /// The `CellTable`
    pub fn from_csv_path<P: AsRef<Path>>(path: P, columns: &CellColumns) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(file, columns)
    }

    /// Read a cell table from any reader of delimited text
    ///
    /// Coordinates that are empty or do not parse become `NaN` and are
    /// reported per image by `ImageCells::validate()`. Every non-mapped
    /// column whose non-empty values all parse as numbers is kept as a
    /// marker column.
    ///
    /// ### Params
    ///
    /// * `reader` - The reader with a header line
    /// * `columns` - The column mapping
    ///
    /// ### Returns
    ///
    /// The `CellTable`
    pub fn from_csv_reader<R: Read>(reader: R, columns: &CellColumns) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(columns.delimiter)
            .has_headers(true)
            .from_reader(reader);

        let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.to_string()).collect();
        let find = |name: &str| -> Result<usize> {
            headers.iter().position(|h| h == name).ok_or_else(|| {
                SpatialError::InvalidConfig(format!("Column '{}' not found in cell table", name))
            })
        };

        let image_col = find(columns.image_id.as_str())?;
        let type_col = find(columns.cell_type.as_str())?;
        let x_col = find(columns.x.as_str())?;
        let y_col = find(columns.y.as_str())?;
        let cell_col = columns.cell_id.as_deref().map(find).transpose()?;
        let subject_col = columns.subject_id.as_deref().map(find).transpose()?;

        let mapped: FxHashSet<usize> = [Some(image_col), Some(type_col), Some(x_col), Some(y_col)]
            .into_iter()
            .chain([cell_col, subject_col])
            .flatten()
            .collect();
        let other_cols: Vec<usize> = (0..headers.len()).filter(|c| !mapped.contains(c)).collect();

        let parse = |s: &str| -> f64 {
            let s = s.trim();
            if s.is_empty() || s.eq_ignore_ascii_case("na") {
                f64::NAN
            } else {
                s.parse::<f64>().unwrap_or(f64::NAN)
            }
        };

        let mut cell_id = Vec::new();
        let mut image_id = Vec::new();
        let mut subject_id = Vec::new();
        let mut cell_type = Vec::new();
        let mut x = Vec::new();
        let mut y = Vec::new();
        let mut other: Vec<Vec<f64>> = vec![Vec::new(); other_cols.len()];
        let mut numeric: Vec<bool> = vec![true; other_cols.len()];

        for (row, record) in rdr.records().enumerate() {
            let record = record?;
            let field = |c: usize| record.get(c).unwrap_or("");
            cell_id.push(match cell_col {
                Some(c) => field(c).to_string(),
                None => row.to_string(),
            });
            image_id.push(field(image_col).to_string());
            cell_type.push(field(type_col).to_string());
            x.push(parse(field(x_col)));
            y.push(parse(field(y_col)));
            if let Some(c) = subject_col {
                subject_id.push(field(c).to_string());
            }
            for (k, &c) in other_cols.iter().enumerate() {
                let raw = field(c).trim();
                let value = parse(raw);
                if value.is_nan() && !raw.is_empty() && !raw.eq_ignore_ascii_case("na") {
                    numeric[k] = false;
                }
                other[k].push(value);
            }
        }

        let mut table = Self::new(cell_id, image_id, cell_type, x, y)?;
        if subject_col.is_some() {
            table = table.with_subjects(subject_id)?;
        }
        for ((values, is_numeric), &c) in other.into_iter().zip(numeric).zip(other_cols.iter()) {
            if is_numeric {
                table = table.with_marker(&headers[c], values)?;
            }
        }

        Ok(table)
    }

    /// Split the table into images
    ///
    /// ### Returns
    ///
    /// One `ImageCells` per image, sorted by image identifier
    pub fn images(&self) -> Vec<ImageCells> {
        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, id) in self.image_id.iter().enumerate() {
            groups.entry(id.as_str()).or_default().push(i);
        }

        groups
            .into_iter()
            .map(|(id, rows)| ImageCells {
                image_id: id.to_string(),
                subject_ids: self
                    .subject_id
                    .as_ref()
                    .map(|s| rows.iter().map(|&r| s[r].clone()).collect()),
                cell_id: rows.iter().map(|&r| self.cell_id[r].clone()).collect(),
                cell_type: rows.iter().map(|&r| self.cell_type[r].clone()).collect(),
                x: rows.iter().map(|&r| self.x[r]).collect(),
                y: rows.iter().map(|&r| self.y[r]).collect(),
            })
            .collect()
    }

    /// Calculate the mean marker profile of every cell type
    ///
    /// Missing marker values are skipped.
    ///
    /// ### Returns
    ///
    /// The `MarkerProfiles`, or `InvalidConfig` if the table holds no
    /// marker columns.
    pub fn mean_marker_profiles(&self) -> Result<MarkerProfiles> {
        if self.markers.is_empty() {
            return Err(SpatialError::InvalidConfig(
                "Cell table has no marker columns".to_string(),
            ));
        }
        let cell_types = self.cell_types();
        let type_pos: BTreeMap<&str, usize> = cell_types
            .iter()
            .enumerate()
            .map(|(i, t)| (t.as_str(), i))
            .collect();

        let n_types = cell_types.len();
        let n_markers = self.markers.len();
        let mut sums = Mat::<f64>::zeros(n_types, n_markers);
        let mut counts = Mat::<f64>::zeros(n_types, n_markers);

        for (m, marker) in self.markers.iter().enumerate() {
            for (cell, value) in marker.values.iter().enumerate() {
                if !value.is_finite() {
                    continue;
                }
                if let Some(&t) = type_pos.get(self.cell_type[cell].as_str()) {
                    sums[(t, m)] += value;
                    counts[(t, m)] += 1.0;
                }
            }
        }

        let means = Mat::from_fn(n_types, n_markers, |t, m| {
            if counts[(t, m)] > 0.0 {
                sums[(t, m)] / counts[(t, m)]
            } else {
                f64::NAN
            }
        });

        Ok(MarkerProfiles {
            cell_types,
            markers: self.markers.iter().map(|m| m.name.clone()).collect(),
            means,
        })
    }
}

////////////////
// ImageCells //
////////////////

impl ImageCells {
    /// Number of cells in the image
    pub fn len(&self) -> usize {
        self.cell_id.len()
    }

    /// Is the image empty
    pub fn is_empty(&self) -> bool {
        self.cell_id.is_empty()
    }

    /// The subject of this image, if subjects were supplied
    pub fn subject(&self) -> Option<&str> {
        self.subject_ids
            .as_ref()
            .and_then(|s| s.first())
            .map(|s| s.as_str())
    }

    /// Number of cells per cell type
    pub fn type_counts(&self) -> BTreeMap<String, usize> {
        let mut res = BTreeMap::new();
        for t in &self.cell_type {
            *res.entry(t.clone()).or_insert(0) += 1;
        }
        res
    }

    /// Check the image for malformed records
    ///
    /// Non-finite coordinates, duplicated cell identifiers, exactly
    /// duplicated coordinates and more than one subject per image are
    /// reported as `InputData` errors. Nothing is dropped or repaired.
    ///
    /// ### Returns
    ///
    /// `Ok(())` if the image is well formed
    pub fn validate(&self) -> Result<()> {
        if let Some(pos) = self
            .x
            .iter()
            .zip(self.y.iter())
            .position(|(x, y)| !x.is_finite() || !y.is_finite())
        {
            return Err(SpatialError::input(
                &self.image_id,
                format!("cell '{}' has missing or non-finite coordinates", self.cell_id[pos]),
            ));
        }

        let mut ids = FxHashSet::with_capacity_and_hasher(self.len(), FxBuildHasher);
        for id in &self.cell_id {
            if !ids.insert(id.as_str()) {
                return Err(SpatialError::input(
                    &self.image_id,
                    format!("duplicated cell id '{}'", id),
                ));
            }
        }

        let mut coords = FxHashSet::with_capacity_and_hasher(self.len(), FxBuildHasher);
        for (i, (x, y)) in self.x.iter().zip(self.y.iter()).enumerate() {
            // -0.0 and 0.0 are the same location
            let key = ((x + 0.0).to_bits(), (y + 0.0).to_bits());
            if !coords.insert(key) {
                return Err(SpatialError::input(
                    &self.image_id,
                    format!(
                        "cell '{}' duplicates the coordinates ({}, {}) of another cell",
                        self.cell_id[i], x, y
                    ),
                ));
            }
        }

        if let Some(subjects) = &self.subject_ids {
            if let Some(first) = subjects.first() {
                if let Some(other) = subjects.iter().find(|s| *s != first) {
                    return Err(SpatialError::input(
                        &self.image_id,
                        format!("image maps to more than one subject ('{}', '{}')", first, other),
                    ));
                }
            }
        }

        Ok(())
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(x: &[&str]) -> Vec<String> {
        x.iter().map(|s| s.to_string()).collect()
    }

    fn small_table() -> CellTable {
        CellTable::new(
            strings(&["c1", "c2", "c3", "c1"]),
            strings(&["img2", "img2", "img2", "img1"]),
            strings(&["A", "B", "A", "B"]),
            vec![1.0, 2.0, 3.0, 4.0],
            vec![1.0, 2.0, 3.0, 4.0],
        )
        .unwrap()
    }

    #[test]
    fn test_length_mismatch_is_config_error() {
        let res = CellTable::new(
            strings(&["c1"]),
            strings(&["img1", "img1"]),
            strings(&["A"]),
            vec![1.0],
            vec![1.0],
        );
        assert!(matches!(res, Err(SpatialError::InvalidConfig(_))));
    }

    #[test]
    fn test_images_sorted_by_id() {
        let images = small_table().images();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].image_id, "img1");
        assert_eq!(images[1].image_id, "img2");
        assert_eq!(images[1].len(), 3);
        assert_eq!(images[1].type_counts().get("A"), Some(&2));
    }

    #[test]
    fn test_validate_reports_bad_records() {
        let mut image = small_table().images().remove(1);
        assert!(image.validate().is_ok());

        image.x[1] = f64::NAN;
        let err = image.validate().unwrap_err();
        assert_eq!(err.kind(), "InputDataError");

        image.x[1] = 1.0;
        image.y[1] = 1.0;
        assert!(image.validate().is_err());

        image.x[1] = 5.0;
        image.cell_id[1] = "c1".to_string();
        assert!(image.validate().is_err());
    }

    #[test]
    fn test_read_csv_with_markers() {
        let data = "cell_id,image_id,cell_type,x,y,CD3,note\n\
                    a,i1,T,1.0,2.0,5.5,foo\n\
                    b,i1,B,3.0,,1.5,bar\n\
                    c,i2,T,4.0,4.0,NA,baz\n";
        let table = CellTable::from_csv_reader(data.as_bytes(), &CellColumns::default()).unwrap();
        assert_eq!(table.len(), 3);
        assert!(table.y[1].is_nan());
        assert_eq!(table.markers.len(), 1);
        assert_eq!(table.markers[0].name, "CD3");

        let profiles = table.mean_marker_profiles().unwrap();
        assert_eq!(profiles.cell_types, vec!["B", "T"]);
        assert_eq!(profiles.means[(1, 0)], 5.5);
    }

    #[test]
    fn test_missing_column() {
        let data = "image_id,cell_type,x\ni1,T,1.0\n";
        let res = CellTable::from_csv_reader(data.as_bytes(), &CellColumns::default());
        assert!(matches!(res, Err(SpatialError::InvalidConfig(_))));
    }
}
