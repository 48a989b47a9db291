use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use crate::core::data::cells::{CellTable, ImageCells};
use crate::core::hierarchy::cell_types::{CellTypeHierarchy, ParentCombination, ParentSpec};
use crate::core::spatial::kontextual::{check_parent, kontextual_on_pattern};
use crate::core::spatial::point_pattern::{validate_radii, ImagePattern, PointPatternParams};
use crate::error::{Result, SpatialError};

//////////////////////////////
// ENUMS, TYPES, STRUCTURES //
//////////////////////////////

/// One column of the association table
///
/// ### Fields
///
/// * `from` - The focal cell type
/// * `to` - The neighbouring cell type
/// * `parent` - Optional parent population; makes the column contextual
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PairSpec {
    pub from: String,
    pub to: String,
    pub parent: Option<ParentSpec>,
}

impl PairSpec {
    /// A plain `from`/`to` pair
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            parent: None,
        }
    }

    /// A contextual pair relative to a parent population
    pub fn contextual(from: &str, to: &str, parent: ParentSpec) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            parent: Some(parent),
        }
    }

    /// Contextual pairs of parent combinations
    ///
    /// ### Params
    ///
    /// * `combinations` - The `(from, to, parent)` triples
    /// * `hierarchy` - The hierarchy the parents are taken from
    ///
    /// ### Returns
    ///
    /// One `PairSpec` per combination, `InvalidHierarchy` for unknown
    /// parents.
    pub fn from_combinations(
        combinations: &[ParentCombination],
        hierarchy: &CellTypeHierarchy,
    ) -> Result<Vec<Self>> {
        combinations
            .iter()
            .map(|c| {
                let parent = hierarchy
                    .parent_spec(&c.parent)
                    .ok_or_else(|| SpatialError::hierarchy(&c.column_name(), "unknown parent"))?;
                Ok(Self::contextual(&c.from, &c.to, parent))
            })
            .collect()
    }

    /// Column name: `from__to` or `from__to__parent`
    pub fn column_name(&self) -> String {
        match &self.parent {
            Some(parent) => format!("{}__{}__{}", self.from, self.to, parent.name),
            None => format!("{}__{}", self.from, self.to),
        }
    }
}

/// Parameters of a batch over many images
///
/// ### Fields
///
/// * `n_threads` - Number of worker threads; `0` uses one per core
/// * `chunk_size` - Minimum number of images handed to a worker at once
/// * `verbose` - Log per image progress at `info` instead of `debug`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BatchParams {
    pub n_threads: usize,
    pub chunk_size: usize,
    pub verbose: bool,
}

impl Default for BatchParams {
    fn default() -> Self {
        Self {
            n_threads: 0,
            chunk_size: 1,
            verbose: false,
        }
    }
}

impl BatchParams {
    /// Build the thread pool for one batch call
    pub fn thread_pool(&self) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.n_threads)
            .build()
            .map_err(|e| SpatialError::InvalidConfig(format!("failed to build thread pool: {}", e)))
    }
}

/// A unit of work that failed without aborting the batch
///
/// ### Fields
///
/// * `kind` - Error kind, e.g. `InputDataError`
/// * `image_id` - The affected image, if any
/// * `column` - The affected column, if any
/// * `error` - The underlying error
#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    pub kind: String,
    pub image_id: Option<String>,
    pub column: Option<String>,
    pub error: SpatialError,
}

impl BatchFailure {
    pub fn new(error: SpatialError, image_id: Option<&str>, column: Option<&str>) -> Self {
        Self {
            kind: error.kind().to_string(),
            image_id: image_id.map(str::to_string),
            column: column.map(str::to_string),
            error,
        }
    }
}

/// Wide table of statistic values
///
/// ### Fields
///
/// * `row_ids` - Image (or subject) ids, sorted
/// * `subjects` - Subject of every row, if known
/// * `columns` - Column names, sorted
/// * `values` - Row major values; `None` is missing
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AssociationTable {
    pub row_ids: Vec<String>,
    pub subjects: Option<Vec<String>>,
    pub columns: Vec<String>,
    pub values: Vec<Vec<Option<f64>>>,
}

/// Cell counts behind every entry of an `AssociationTable`
///
/// ### Fields
///
/// * `row_ids` - As in the table
/// * `columns` - As in the table
/// * `n_from` - Number of `from` cells per row and column
/// * `n_to` - Number of `to` cells per row and column
/// * `n_parent` - Number of parent population cells per row and column;
///   `None` for columns without a parent
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CountTable {
    pub row_ids: Vec<String>,
    pub columns: Vec<String>,
    pub n_from: Vec<Vec<usize>>,
    pub n_to: Vec<Vec<usize>>,
    pub n_parent: Vec<Vec<Option<usize>>>,
}

/// Results of `build_association_table`
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationBatch {
    pub table: AssociationTable,
    pub counts: CountTable,
    pub failures: Vec<BatchFailure>,
}

//////////////////////
// AssociationTable //
//////////////////////

impl AssociationTable {
    pub fn nrows(&self) -> usize {
        self.row_ids.len()
    }

    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    /// Value of one entry
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        self.values[row][col]
    }

    /// Position of a column
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// All values of one column
    pub fn column_values(&self, col: usize) -> Vec<Option<f64>> {
        self.values.iter().map(|row| row[col]).collect()
    }

    /// Row id to subject id, if subjects are known
    pub fn subject_map(&self) -> Option<BTreeMap<String, String>> {
        self.subjects.as_ref().map(|subjects| {
            self.row_ids
                .iter()
                .cloned()
                .zip(subjects.iter().cloned())
                .collect()
        })
    }

    /// Write the table as tab separated text
    ///
    /// Missing values are written as `NA`.
    ///
    /// ### Params
    ///
    /// * `writer` - Where to write to
    pub fn write_tsv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer);

        let mut header = vec!["image_id".to_string()];
        header.extend(self.columns.iter().cloned());
        wtr.write_record(&header)?;

        for (row_id, row) in self.row_ids.iter().zip(self.values.iter()) {
            let mut record = vec![row_id.clone()];
            record.extend(row.iter().map(|v| match v {
                Some(v) => v.to_string(),
                None => "NA".to_string(),
            }));
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Write the table as tab separated text to a file
    pub fn write_tsv_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = std::fs::File::create(path)?;
        self.write_tsv(std::io::BufWriter::new(file))
    }

    /// Average rows per subject
    ///
    /// Missing values are skipped; a subject without any value in a column
    /// stays missing.
    ///
    /// ### Returns
    ///
    /// The table with one row per subject (sorted), or `InvalidConfig` if the
    /// subjects are unknown.
    pub fn collapse_to_subjects(&self) -> Result<AssociationTable> {
        let groups = self.subject_groups()?;
        let values = groups
            .values()
            .map(|rows| {
                (0..self.ncols())
                    .map(|col| {
                        let present: Vec<f64> = rows.iter().filter_map(|&r| self.values[r][col]).collect();
                        if present.is_empty() {
                            None
                        } else {
                            Some(present.iter().sum::<f64>() / present.len() as f64)
                        }
                    })
                    .collect()
            })
            .collect();

        Ok(AssociationTable {
            row_ids: groups.keys().cloned().collect(),
            subjects: Some(groups.keys().cloned().collect()),
            columns: self.columns.clone(),
            values,
        })
    }

    /// Rows of every subject
    fn subject_groups(&self) -> Result<BTreeMap<String, Vec<usize>>> {
        let subjects = self.subjects.as_ref().ok_or_else(|| {
            SpatialError::InvalidConfig("Association table has no subject ids".to_string())
        })?;
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (row, subject) in subjects.iter().enumerate() {
            groups.entry(subject.clone()).or_default().push(row);
        }
        Ok(groups)
    }
}

impl CountTable {
    /// Count of the rarer of the two cell types of one entry
    pub fn min_count(&self, row: usize, col: usize) -> usize {
        self.n_from[row][col].min(self.n_to[row][col])
    }
}

impl AssociationBatch {
    /// Collapse the table to subjects
    ///
    /// Values are averaged, counts are summed.
    pub fn collapse_to_subjects(&self) -> Result<AssociationBatch> {
        let groups = self.table.subject_groups()?;
        let sum_counts = |counts: &Vec<Vec<usize>>| -> Vec<Vec<usize>> {
            groups
                .values()
                .map(|rows| {
                    (0..self.table.ncols())
                        .map(|col| rows.iter().map(|&r| counts[r][col]).sum())
                        .collect()
                })
                .collect()
        };

        Ok(AssociationBatch {
            table: self.table.collapse_to_subjects()?,
            counts: CountTable {
                row_ids: groups.keys().cloned().collect(),
                columns: self.counts.columns.clone(),
                n_from: sum_counts(&self.counts.n_from),
                n_to: sum_counts(&self.counts.n_to),
                n_parent: groups
                    .values()
                    .map(|rows| {
                        (0..self.table.ncols())
                            .map(|col| rows.iter().map(|&r| self.counts.n_parent[r][col]).sum())
                            .collect()
                    })
                    .collect(),
            },
            failures: self.failures.clone(),
        })
    }
}

//////////////////
// Batch driver //
//////////////////

/// Statistic value and cell counts of one entry
struct Entry {
    value: Option<f64>,
    n_from: usize,
    n_to: usize,
    n_parent: Option<usize>,
}

/// Evaluate every pair within one image
///
/// ### Params
///
/// * `image` - The cells of the image
/// * `pairs` - The (valid) pairs, in column order
/// * `radii` - The radii to evaluate
/// * `params` - The point pattern parameters
///
/// ### Returns
///
/// One entry per pair plus the failures of single pairs, or the error that
/// invalidates the whole image.
fn process_image(
    image: &ImageCells,
    pairs: &[(String, PairSpec)],
    radii: &[f64],
    params: &PointPatternParams,
) -> Result<(Vec<Entry>, Vec<BatchFailure>)> {
    let max_r = validate_radii(radii)?;
    let pattern = ImagePattern::new(image, params, max_r)?;

    let mut entries = Vec::with_capacity(pairs.len());
    let mut failures = Vec::new();
    for (name, pair) in pairs {
        let (res, n_parent) = match &pair.parent {
            None => (
                pattern
                    .l_curve(&pair.from, &pair.to, radii)
                    .map(|curve| curve.map(|c| c.summary())),
                None,
            ),
            Some(parent) => match kontextual_on_pattern(&pattern, &pair.from, &pair.to, &parent.types, radii) {
                Ok(Some(res)) => (Ok(Some(res.kontextual_summary())), Some(res.n_parent)),
                // below min_cells; the parent is still counted
                Ok(None) => (Ok(None), Some(pattern.members_of(&parent.types).len())),
                Err(err) => (Err(err), None),
            },
        };
        let value = match res {
            Ok(value) => value,
            Err(err) => {
                failures.push(BatchFailure::new(err, Some(image.image_id.as_str()), Some(name.as_str())));
                None
            }
        };
        entries.push(Entry {
            value,
            n_from: pattern.count(&pair.from),
            n_to: pattern.count(&pair.to),
            n_parent,
        });
    }
    Ok((entries, failures))
}

/// Evaluate the statistic for every image and pair
///
/// Images are processed in parallel on a pool local to this call. A failing
/// image is dropped from the rows and reported; a contextual pair whose
/// parent does not hold its `to` type is dropped from the columns and
/// reported. Rows are sorted by image id and columns by name, so repeated
/// runs give identical tables.
///
/// ### Params
///
/// * `cells` - The cells of all images
/// * `pairs` - The pairs to evaluate; identical repeats are merged
/// * `radii` - The radii; the table holds the mean deviation over them
/// * `params` - The point pattern parameters
/// * `batch` - The batch parameters
///
/// ### Returns
///
/// The `AssociationBatch`, or an error for invalid global parameters or a
/// column name requested with different parent populations.
pub fn build_association_table(
    cells: &CellTable,
    pairs: &[PairSpec],
    radii: &[f64],
    params: &PointPatternParams,
    batch: &BatchParams,
) -> Result<AssociationBatch> {
    validate_radii(radii)?;
    params.validate()?;

    let mut failures: Vec<BatchFailure> = Vec::new();
    let mut valid: BTreeMap<String, PairSpec> = BTreeMap::new();
    for pair in pairs {
        let name = pair.column_name();
        if let Some(parent) = &pair.parent {
            if let Err(err) = check_parent(&pair.from, &pair.to, &parent.types) {
                warn!("Skipping column {}: {}", name, err);
                failures.push(BatchFailure::new(err, None, Some(name.as_str())));
                continue;
            }
        }
        match valid.get(&name) {
            Some(known) if known != pair => {
                return Err(SpatialError::InvalidConfig(format!(
                    "Column {} is requested with different parent populations",
                    name
                )));
            }
            Some(_) => {}
            None => {
                valid.insert(name, pair.clone());
            }
        }
    }
    let valid: Vec<(String, PairSpec)> = valid.into_iter().collect();

    let images = cells.images();
    let pool = batch.thread_pool()?;
    let chunk = batch.chunk_size.max(1);

    let results: Vec<Result<(Vec<Entry>, Vec<BatchFailure>)>> = pool.install(|| {
        images
            .par_iter()
            .with_min_len(chunk)
            .map(|image| {
                let res = process_image(image, &valid, radii, params);
                if batch.verbose {
                    info!("Processed image {} ({} cells)", image.image_id, image.len());
                } else {
                    debug!("Processed image {} ({} cells)", image.image_id, image.len());
                }
                res
            })
            .collect()
    });

    let mut row_ids = Vec::new();
    let mut subjects = Vec::new();
    let mut values = Vec::new();
    let mut n_from = Vec::new();
    let mut n_to = Vec::new();
    let mut n_parent = Vec::new();

    for (image, res) in images.iter().zip(results) {
        match res {
            Ok((entries, pair_failures)) => {
                row_ids.push(image.image_id.clone());
                subjects.push(image.subject().unwrap_or(image.image_id.as_str()).to_string());
                values.push(entries.iter().map(|e| e.value).collect());
                n_from.push(entries.iter().map(|e| e.n_from).collect());
                n_to.push(entries.iter().map(|e| e.n_to).collect());
                n_parent.push(entries.iter().map(|e| e.n_parent).collect());
                failures.extend(pair_failures);
            }
            Err(err) => {
                warn!("Skipping image {}: {}", image.image_id, err);
                failures.push(BatchFailure::new(err, Some(image.image_id.as_str()), None));
            }
        }
    }

    info!(
        "Association table: {} of {} images, {} columns, {} failures",
        row_ids.len(),
        images.len(),
        valid.len(),
        failures.len()
    );

    let columns: Vec<String> = valid.into_iter().map(|(name, _)| name).collect();
    Ok(AssociationBatch {
        table: AssociationTable {
            row_ids: row_ids.clone(),
            subjects: cells.subject_id.as_ref().map(|_| subjects),
            columns: columns.clone(),
            values,
        },
        counts: CountTable {
            row_ids,
            columns,
            n_from,
            n_to,
            n_parent,
        },
        failures,
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::*;
    use crate::core::spatial::window::Rect;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn cells() -> CellTable {
        let rect = Rect::new(0.0, 200.0, 0.0, 200.0).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let img_1 = SyntheticImage::new("img_2")
            .with_subject("s1")
            .add("A", &uniform_points(40, &rect, &mut rng))
            .add("B", &uniform_points(40, &rect, &mut rng));
        // no B cells at all
        let img_2 = SyntheticImage::new("img_1")
            .with_subject("s1")
            .add("A", &uniform_points(40, &rect, &mut rng))
            .add("C", &uniform_points(40, &rect, &mut rng));
        let img_3 = SyntheticImage::new("img_3")
            .with_subject("s2")
            .add("A", &[(1.0, 1.0), (1.0, 1.0)]);
        combine_images(vec![img_1, img_2, img_3]).unwrap()
    }

    fn pairs() -> Vec<PairSpec> {
        let parent = ParentSpec {
            name: "bc".to_string(),
            types: vec!["B".to_string(), "C".to_string()],
        };
        vec![
            PairSpec::new("B", "A"),
            PairSpec::new("A", "B"),
            PairSpec::contextual("A", "B", parent.clone()),
            PairSpec::contextual("A", "D", parent),
        ]
    }

    #[test]
    fn test_missing_type_is_na_and_failures_are_isolated() {
        let res = build_association_table(
            &cells(),
            &pairs(),
            &[20.0],
            &PointPatternParams::default(),
            &BatchParams::default(),
        )
        .unwrap();

        assert_eq!(res.table.row_ids, vec!["img_1", "img_2"]);
        assert_eq!(res.table.columns, vec!["A__B", "A__B__bc", "B__A"]);

        let col = res.table.column_index("A__B").unwrap();
        assert_eq!(res.table.get(0, col), None);
        assert!(res.table.get(1, col).is_some());
        assert_eq!(res.counts.n_to[0][col], 0);

        // duplicated coordinates in img_3 and the invalid parent of A__D
        assert_eq!(res.failures.len(), 2);
        assert!(res
            .failures
            .iter()
            .any(|f| f.kind == "InputDataError" && f.image_id.as_deref() == Some("img_3")));
        assert!(res
            .failures
            .iter()
            .any(|f| f.kind == "InvalidHierarchy" && f.column.as_deref() == Some("A__D__bc")));
    }

    #[test]
    fn test_table_is_reproducible() {
        let run = |threads: usize| {
            let batch = BatchParams {
                n_threads: threads,
                ..BatchParams::default()
            };
            let res = build_association_table(
                &cells(),
                &pairs(),
                &[10.0, 20.0],
                &PointPatternParams::default(),
                &batch,
            )
            .unwrap();
            let mut buf = Vec::new();
            res.table.write_tsv(&mut buf).unwrap();
            buf
        };
        let first = run(1);
        assert_eq!(first, run(1));
        assert_eq!(first, run(3));
        let text = String::from_utf8(first).unwrap();
        assert!(text.starts_with("image_id\tA__B\tA__B__bc\tB__A\n"));
        assert!(text.contains("\tNA"));
    }

    #[test]
    fn test_parent_counts_of_contextual_columns() {
        let res = build_association_table(
            &cells(),
            &pairs(),
            &[20.0],
            &PointPatternParams::default(),
            &BatchParams::default(),
        )
        .unwrap();

        let ctx = res.table.column_index("A__B__bc").unwrap();
        let plain = res.table.column_index("A__B").unwrap();
        // img_1 holds 40 C and no B, img_2 holds 40 B and no C
        assert_eq!(res.counts.n_parent[0][ctx], Some(40));
        assert_eq!(res.counts.n_parent[1][ctx], Some(40));
        assert_eq!(res.counts.n_parent[0][plain], None);
        assert_eq!(res.counts.n_parent[1][plain], None);

        let collapsed = res.collapse_to_subjects().unwrap();
        assert_eq!(collapsed.counts.n_parent, vec![vec![None, Some(80), None]]);
    }

    #[test]
    fn test_conflicting_parents_of_one_column() {
        let other = ParentSpec {
            name: "bc".to_string(),
            types: vec!["B".to_string()],
        };
        let mut pairs = pairs();
        pairs.push(PairSpec::contextual("A", "B", other));
        let res = build_association_table(
            &cells(),
            &pairs,
            &[20.0],
            &PointPatternParams::default(),
            &BatchParams::default(),
        );
        assert!(matches!(res, Err(SpatialError::InvalidConfig(_))));

        // exact repeats are merged
        let mut repeated = self::pairs();
        repeated.push(PairSpec::new("A", "B"));
        let res = build_association_table(
            &cells(),
            &repeated,
            &[20.0],
            &PointPatternParams::default(),
            &BatchParams::default(),
        )
        .unwrap();
        assert_eq!(res.table.ncols(), 3);
    }

    #[test]
    fn test_collapse_to_subjects() {
        let table = AssociationTable {
            row_ids: vec!["i1".into(), "i2".into(), "i3".into()],
            subjects: Some(vec!["s1".into(), "s1".into(), "s2".into()]),
            columns: vec!["A__B".into()],
            values: vec![vec![Some(1.0)], vec![Some(3.0)], vec![None]],
        };
        let collapsed = table.collapse_to_subjects().unwrap();
        assert_eq!(collapsed.row_ids, vec!["s1", "s2"]);
        assert_eq!(collapsed.values, vec![vec![Some(2.0)], vec![None]]);

        let no_subjects = AssociationTable {
            subjects: None,
            ..table
        };
        assert!(no_subjects.collapse_to_subjects().is_err());
    }
}
