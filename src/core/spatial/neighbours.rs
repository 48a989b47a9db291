use rustc_hash::FxHashMap;

use crate::assert_same_len;

/// Fixed-radius neighbour lists of all cells of one image
///
/// Built once per image with a uniform grid whose bucket size equals the
/// largest radius that will be queried. Every list is sorted by distance
/// and excludes the cell itself.
///
/// ### Fields
///
/// * `max_radius` - The largest radius that can be queried
/// * `neighbours` - Per cell `(index, distance)` tuples within `max_radius`
#[derive(Debug, Clone)]
pub struct NeighbourIndex {
    max_radius: f64,
    neighbours: Vec<Vec<(usize, f64)>>,
}

impl NeighbourIndex {
    /// Build the neighbour lists
    ///
    /// ### Params
    ///
    /// * `x` - x coordinates
    /// * `y` - y coordinates
    /// * `max_radius` - Largest radius of interest
    ///
    /// ### Returns
    ///
    /// The `NeighbourIndex`
    pub fn build(x: &[f64], y: &[f64], max_radius: f64) -> Self {
        assert_same_len!(x, y);
        let n = x.len();
        let mut neighbours: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];

        if n == 0 || max_radius <= 0.0 || !max_radius.is_finite() {
            return Self {
                max_radius: max_radius.max(0.0),
                neighbours,
            };
        }

        let bucket = |v: f64| (v / max_radius).floor() as i64;
        let mut grid: FxHashMap<(i64, i64), Vec<usize>> = FxHashMap::default();
        for i in 0..n {
            grid.entry((bucket(x[i]), bucket(y[i]))).or_default().push(i);
        }

        let max_sq = max_radius * max_radius;
        for i in 0..n {
            let (bx, by) = (bucket(x[i]), bucket(y[i]));
            let list = &mut neighbours[i];
            for dx in -1..=1 {
                for dy in -1..=1 {
                    let Some(members) = grid.get(&(bx + dx, by + dy)) else {
                        continue;
                    };
                    for &j in members {
                        if j == i {
                            continue;
                        }
                        let d_sq = (x[i] - x[j]).powi(2) + (y[i] - y[j]).powi(2);
                        if d_sq <= max_sq {
                            list.push((j, d_sq.sqrt()));
                        }
                    }
                }
            }
            // ties broken by index so the summation order is fixed
            list.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        }

        Self {
            max_radius,
            neighbours,
        }
    }

    /// Largest radius the index can answer
    pub fn max_radius(&self) -> f64 {
        self.max_radius
    }

    /// Number of indexed cells
    pub fn len(&self) -> usize {
        self.neighbours.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbours.is_empty()
    }

    /// Neighbours of cell `i` within distance `r`
    ///
    /// ### Params
    ///
    /// * `i` - Index of the cell
    /// * `r` - Radius; must not exceed `max_radius`
    ///
    /// ### Returns
    ///
    /// Slice of `(index, distance)` sorted by distance
    pub fn within(&self, i: usize, r: f64) -> &[(usize, f64)] {
        let list = &self.neighbours[i];
        let end = list.partition_point(|&(_, d)| d <= r);
        &list[..end]
    }

    /// All neighbours of cell `i` within `max_radius`
    pub fn all(&self, i: usize) -> &[(usize, f64)] {
        &self.neighbours[i]
    }
}

///////////
// Tests //
///////////
