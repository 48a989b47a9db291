use faer::{Mat, MatRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::assert_symmetric_mat;
use crate::core::data::cells::MarkerProfiles;
use crate::core::hierarchy::cell_types::CellTypeHierarchy;
use crate::error::{Result, SpatialError};

//////////////////////////////
// ENUMS, TYPES, STRUCTURES //
//////////////////////////////

/// Distance between two marker profiles
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkageDistance {
    /// Euclidean distance
    Euclidean,
    /// One minus the Pearson correlation
    Correlation,
}

/// How to cut the dendrogram into parent populations
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum TreeCut {
    /// Into a fixed number of groups
    Clusters(usize),
    /// At a fixed merge height
    Height(f64),
}

/// Parsing the linkage distance
///
/// ### Params
///
/// * `s` - string defining the distance
///
/// ### Returns
///
/// The `LinkageDistance`.
pub fn parse_linkage_distance(s: &str) -> Option<LinkageDistance> {
    match s.to_lowercase().as_str() {
        "euclidean" => Some(LinkageDistance::Euclidean),
        "correlation" | "pearson" => Some(LinkageDistance::Correlation),
        _ => None,
    }
}

/// Parameters of the hierarchy builder
///
/// ### Fields
///
/// * `distance` - Distance between the marker profiles
/// * `scale` - Standardise every marker across cell types first
/// * `cut` - How to cut the dendrogram
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HierarchyParams {
    pub distance: LinkageDistance,
    pub scale: bool,
    pub cut: TreeCut,
}

impl Default for HierarchyParams {
    fn default() -> Self {
        Self {
            distance: LinkageDistance::Euclidean,
            scale: true,
            cut: TreeCut::Clusters(2),
        }
    }
}

/// One agglomeration step
///
/// ### Fields
///
/// * `left` - Node id of the first merged node
/// * `right` - Node id of the second merged node
/// * `height` - Average linkage distance at the merge
/// * `size` - Number of leaves below the new node
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Merge {
    pub left: usize,
    pub right: usize,
    pub height: f64,
    pub size: usize,
}

/// Average linkage dendrogram over cell types
///
/// Node ids `0..n` are the leaves (in the order of `labels`), node `n + k`
/// is created by `merges[k]`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Dendrogram {
    pub labels: Vec<String>,
    pub merges: Vec<Merge>,
}

/////////////
// Helpers //
/////////////

/// Standardise the columns of a matrix
///
/// Constant columns become zero.
fn scale_columns(mat: MatRef<f64>) -> Mat<f64> {
    let (n, p) = (mat.nrows(), mat.ncols());
    let ones = Mat::from_fn(n, 1, |_, _| 1.0);
    let sums = ones.transpose() * mat;

    let centred = Mat::from_fn(n, p, |i, j| mat[(i, j)] - sums[(0, j)] / n as f64);
    let sds: Vec<f64> = (0..p)
        .map(|j| centred.col(j).norm_l2() / (n as f64 - 1.0).max(1.0).sqrt())
        .collect();

    Mat::from_fn(n, p, |i, j| if sds[j] > 0.0 { centred[(i, j)] / sds[j] } else { 0.0 })
}

/// Pearson correlation between the rows of a matrix
///
/// Rows are centred and scaled to unit length, so the correlation matrix is
/// their Gram matrix. Constant rows correlate with nothing (0).
fn row_correlation(mat: MatRef<f64>) -> Mat<f64> {
    let (n, p) = (mat.nrows(), mat.ncols());
    let ones = Mat::from_fn(p, 1, |_, _| 1.0);
    let sums = mat * ones.as_ref();

    let centred = Mat::from_fn(n, p, |i, j| mat[(i, j)] - sums[(i, 0)] / p as f64);
    let norms: Vec<f64> = (0..n).map(|i| centred.row(i).norm_l2()).collect();
    let unit = Mat::from_fn(n, p, |i, j| {
        if norms[i] > 0.0 {
            centred[(i, j)] / norms[i]
        } else {
            0.0
        }
    });

    unit.as_ref() * unit.transpose()
}

/// Pairwise distances between the rows of a matrix
///
/// Euclidean distances come from the Gram matrix
/// (`|a - b|^2 = a'a + b'b - 2 a'b`), correlation distances are `1 - r`.
///
/// ### Params
///
/// * `mat` - Rows are the objects to compare
/// * `distance` - The distance
///
/// ### Returns
///
/// Symmetric distance matrix with a zero diagonal
pub fn row_pairwise_distance(mat: MatRef<f64>, distance: LinkageDistance) -> Mat<f64> {
    let n = mat.nrows();
    let gram = match distance {
        LinkageDistance::Euclidean => mat * mat.transpose(),
        LinkageDistance::Correlation => row_correlation(mat),
    };

    let mut res = Mat::<f64>::zeros(n, n);
    for a in 0..n {
        for b in (a + 1)..n {
            let d = match distance {
                LinkageDistance::Euclidean => (gram[(a, a)] + gram[(b, b)] - 2.0 * gram[(a, b)]).max(0.0).sqrt(),
                LinkageDistance::Correlation => (1.0 - gram[(a, b)]).max(0.0),
            };
            res[(a, b)] = d;
            res[(b, a)] = d;
        }
    }
    res
}

///////////////////////
// Linkage & cutting //
///////////////////////

/// Average linkage (UPGMA) agglomerative clustering
///
/// Ties are broken by the lowest pair of node ids.
///
/// ### Params
///
/// * `labels` - Names of the objects
/// * `dist` - Symmetric distance matrix between the objects
///
/// ### Returns
///
/// The `Dendrogram`
pub fn average_linkage(labels: Vec<String>, dist: MatRef<f64>) -> Dendrogram {
    assert_symmetric_mat!(dist);
    let n = labels.len();
    // active clusters: (node id, leaves)
    let mut active: Vec<(usize, Vec<usize>)> = (0..n).map(|i| (i, vec![i])).collect();
    let mut merges = Vec::with_capacity(n.saturating_sub(1));

    let linkage = |a: &[usize], b: &[usize]| {
        let total: f64 = a.iter().flat_map(|&i| b.iter().map(move |&j| dist[(i, j)])).sum();
        total / (a.len() * b.len()) as f64
    };

    while active.len() > 1 {
        let mut best = (0, 1, f64::INFINITY);
        for a in 0..active.len() {
            for b in (a + 1)..active.len() {
                let d = linkage(&active[a].1, &active[b].1);
                if d < best.2 {
                    best = (a, b, d);
                }
            }
        }
        let (a, b, height) = best;
        let (right_id, right_leaves) = active.remove(b);
        let (left_id, mut leaves) = active.remove(a);
        leaves.extend(right_leaves);
        leaves.sort_unstable();
        merges.push(Merge {
            left: left_id,
            right: right_id,
            height,
            size: leaves.len(),
        });
        active.push((n + merges.len() - 1, leaves));
    }

    Dendrogram { labels, merges }
}

impl Dendrogram {
    /// Number of leaves
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Leaves below a node
    pub fn leaves(&self, node: usize) -> Vec<usize> {
        let n = self.labels.len();
        let mut res = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            if current < n {
                res.push(current);
            } else {
                let merge = &self.merges[current - n];
                stack.push(merge.left);
                stack.push(merge.right);
            }
        }
        res.sort_unstable();
        res
    }

    /// Group the leaves after applying the first `n_merges` merges
    fn groups_after(&self, n_merges: usize) -> Vec<Vec<usize>> {
        let n = self.labels.len();
        let mut top: Vec<usize> = (0..n).collect();
        for (k, merge) in self.merges.iter().take(n_merges).enumerate() {
            for leaf in self.leaves(merge.left).into_iter().chain(self.leaves(merge.right)) {
                top[leaf] = n + k;
            }
        }
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (leaf, node) in top.into_iter().enumerate() {
            groups.entry(node).or_default().push(leaf);
        }
        groups.into_values().collect()
    }

    /// Cut the dendrogram
    ///
    /// ### Params
    ///
    /// * `cut` - Number of groups or merge height
    ///
    /// ### Returns
    ///
    /// The groups as leaf indices
    pub fn cut(&self, cut: TreeCut) -> Result<Vec<Vec<usize>>> {
        let n = self.labels.len();
        let n_merges = match cut {
            TreeCut::Clusters(k) => {
                if k == 0 || k > n {
                    return Err(SpatialError::InvalidConfig(format!(
                        "Cannot cut {} cell types into {} groups",
                        n, k
                    )));
                }
                n - k
            }
            // average linkage heights are monotone
            TreeCut::Height(h) => self.merges.iter().take_while(|m| m.height <= h).count(),
        };
        Ok(self.groups_after(n_merges))
    }

    /// Turn a cut into a cell type hierarchy
    ///
    /// Groups with at least two members become parents named `cluster_<n>`,
    /// numbered by their alphabetically first member; singletons are
    /// unassigned.
    pub fn to_hierarchy(&self, cut: TreeCut) -> Result<CellTypeHierarchy> {
        let mut groups: Vec<Vec<String>> = self
            .cut(cut)?
            .into_iter()
            .filter(|g| g.len() >= 2)
            .map(|g| {
                let mut names: Vec<String> = g.iter().map(|&i| self.labels[i].clone()).collect();
                names.sort();
                names
            })
            .collect();
        groups.sort();

        let parents: BTreeMap<String, Vec<String>> = groups
            .into_iter()
            .enumerate()
            .map(|(i, g)| (format!("cluster_{}", i + 1), g))
            .collect();
        CellTypeHierarchy::new(parents, &self.labels)
    }

    /// Every internal node below the root as a parent
    ///
    /// Parents are named `node_<k>` after the merge step that created them,
    /// so nested groups are nested parents.
    pub fn nested_hierarchy(&self) -> Result<CellTypeHierarchy> {
        let n = self.labels.len();
        let parents: BTreeMap<String, Vec<String>> = (0..self.merges.len().saturating_sub(1))
            .map(|k| {
                let mut names: Vec<String> = self
                    .leaves(n + k)
                    .into_iter()
                    .map(|i| self.labels[i].clone())
                    .collect();
                names.sort();
                (format!("node_{}", k + 1), names)
            })
            .collect();
        CellTypeHierarchy::new(parents, &self.labels)
    }
}

/// Cluster cell types on their mean marker profiles
///
/// ### Params
///
/// * `profiles` - Mean marker profiles per cell type
/// * `params` - The hierarchy parameters
///
/// ### Returns
///
/// The `Dendrogram`, or `InvalidConfig` for fewer than two cell types or
/// missing profile values.
pub fn cluster_cell_types(profiles: &MarkerProfiles, params: &HierarchyParams) -> Result<Dendrogram> {
    let means = profiles.means.as_ref();
    if means.nrows() < 2 {
        return Err(SpatialError::InvalidConfig(
            "At least two cell types are needed to build a hierarchy".to_string(),
        ));
    }
    for i in 0..means.nrows() {
        for j in 0..means.ncols() {
            if !means[(i, j)].is_finite() {
                return Err(SpatialError::InvalidConfig(format!(
                    "Marker '{}' has no values for cell type '{}'",
                    profiles.markers[j], profiles.cell_types[i]
                )));
            }
        }
    }

    let data = if params.scale {
        scale_columns(means)
    } else {
        means.to_owned()
    };
    let dist = row_pairwise_distance(data.as_ref(), params.distance);
    Ok(average_linkage(profiles.cell_types.clone(), dist.as_ref()))
}

/// Derive a cell type hierarchy from marker similarity
///
/// ### Params
///
/// * `profiles` - Mean marker profiles per cell type
/// * `params` - The hierarchy parameters
///
/// ### Returns
///
/// The `CellTypeHierarchy` of the dendrogram cut.
pub fn build_hierarchy(profiles: &MarkerProfiles, params: &HierarchyParams) -> Result<CellTypeHierarchy> {
    cluster_cell_types(profiles, params)?.to_hierarchy(params.cut)
}

///////////
// Tests //
///////////
