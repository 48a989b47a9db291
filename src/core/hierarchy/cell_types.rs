use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Result, SpatialError};

//////////////////////////////
// ENUMS, TYPES, STRUCTURES //
//////////////////////////////

/// Where a cell type sits in the hierarchy
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum TypeMembership {
    /// Child of the listed parents (sorted)
    Assigned(Vec<String>),
    /// Deliberately part of no parent population
    Unassigned,
}

/// A named parent population
///
/// ### Fields
///
/// * `name` - Name of the parent
/// * `types` - The child cell types forming the population (sorted)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParentSpec {
    pub name: String,
    pub types: Vec<String>,
}

/// One `(from, to, parent)` triple for a contextual query
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParentCombination {
    pub from: String,
    pub to: String,
    pub parent: String,
}

impl ParentCombination {
    /// Column name in the association table
    pub fn column_name(&self) -> String {
        format!("{}__{}__{}", self.from, self.to, self.parent)
    }
}

/// Parent to children mapping over a complete cell type vocabulary
///
/// Every type of the vocabulary is either a child of at least one parent or
/// explicitly unassigned. Parents may overlap or nest.
///
/// ### Fields
///
/// * `parents` - Parent name to its children
/// * `all_types` - The complete cell type vocabulary
/// * `unassigned` - Types in no parent
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CellTypeHierarchy {
    parents: BTreeMap<String, BTreeSet<String>>,
    all_types: BTreeSet<String>,
    unassigned: BTreeSet<String>,
}

impl CellTypeHierarchy {
    /// Generate a new hierarchy
    ///
    /// ### Params
    ///
    /// * `parents` - Parent name to child cell types
    /// * `all_types` - The complete vocabulary of cell types
    ///
    /// ### Returns
    ///
    /// The hierarchy, or `InvalidHierarchy` if a parent is empty or lists a
    /// child outside of the vocabulary.
    pub fn new<S: AsRef<str>>(
        parents: BTreeMap<String, Vec<String>>,
        all_types: &[S],
    ) -> Result<Self> {
        let all_types: BTreeSet<String> =
            all_types.iter().map(|t| t.as_ref().to_string()).collect();

        let mut mapped: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (name, children) in parents {
            if children.is_empty() {
                return Err(SpatialError::hierarchy(&name, "parent has no children"));
            }
            if let Some(unknown) = children.iter().find(|c| !all_types.contains(*c)) {
                return Err(SpatialError::hierarchy(
                    &name,
                    format!("child '{}' is not a known cell type", unknown),
                ));
            }
            mapped.insert(name, children.into_iter().collect());
        }

        let assigned: BTreeSet<&String> = mapped.values().flatten().collect();
        let unassigned = all_types
            .iter()
            .filter(|t| !assigned.contains(t))
            .cloned()
            .collect();

        Ok(Self {
            parents: mapped,
            all_types,
            unassigned,
        })
    }

    /// All cell types of the vocabulary (sorted)
    pub fn all_types(&self) -> impl Iterator<Item = &String> {
        self.all_types.iter()
    }

    /// Cell types that belong to no parent (sorted)
    pub fn unassigned(&self) -> impl Iterator<Item = &String> {
        self.unassigned.iter()
    }

    /// Parent names (sorted)
    pub fn parent_names(&self) -> impl Iterator<Item = &String> {
        self.parents.keys()
    }

    /// Children of a parent
    pub fn children(&self, parent: &str) -> Option<&BTreeSet<String>> {
        self.parents.get(parent)
    }

    /// The parent population as a `ParentSpec`
    pub fn parent_spec(&self, parent: &str) -> Option<ParentSpec> {
        self.parents.get(parent).map(|children| ParentSpec {
            name: parent.to_string(),
            types: children.iter().cloned().collect(),
        })
    }

    /// Membership of a cell type
    ///
    /// ### Params
    ///
    /// * `cell_type` - The cell type
    ///
    /// ### Returns
    ///
    /// `TypeMembership`, or `InvalidHierarchy` if the type is neither mapped
    /// nor unassigned.
    pub fn membership(&self, cell_type: &str) -> Result<TypeMembership> {
        if self.unassigned.contains(cell_type) {
            return Ok(TypeMembership::Unassigned);
        }
        let parents: Vec<String> = self
            .parents
            .iter()
            .filter(|(_, children)| children.contains(cell_type))
            .map(|(name, _)| name.clone())
            .collect();
        if parents.is_empty() {
            Err(SpatialError::hierarchy(
                cell_type,
                "cell type is neither part of the hierarchy nor unassigned",
            ))
        } else {
            Ok(TypeMembership::Assigned(parents))
        }
    }
}

/// Contextual queries of a hierarchy together with the rejected types
///
/// ### Fields
///
/// * `combinations` - The valid queries, sorted by `from`, `to` and `parent`
/// * `failures` - One `InvalidHierarchy` per type unknown to the hierarchy
#[derive(Debug)]
pub struct ParentCombinations {
    pub combinations: Vec<ParentCombination>,
    pub failures: Vec<SpatialError>,
}

/// Enumerate the valid contextual queries
///
/// For every parent, every `to` within it and every `from` in `all_types`
/// other than `to`. A type that is neither mapped nor unassigned is left out
/// and reported; the remaining types are still enumerated.
///
/// ### Params
///
/// * `all_types` - The cell types to use as `from`
/// * `hierarchy` - The cell type hierarchy
///
/// ### Returns
///
/// The `ParentCombinations`.
pub fn parent_combinations<S: AsRef<str>>(all_types: &[S], hierarchy: &CellTypeHierarchy) -> ParentCombinations {
    let requested: BTreeSet<&str> = all_types.iter().map(|t| t.as_ref()).collect();
    let mut failures = Vec::new();
    let mut from_types: BTreeSet<&str> = BTreeSet::new();
    for t in requested {
        match hierarchy.membership(t) {
            Ok(_) => {
                from_types.insert(t);
            }
            Err(err) => {
                warn!("Skipping cell type {}: {}", t, err);
                failures.push(err);
            }
        }
    }

    let mut res: Vec<ParentCombination> = Vec::new();
    for (parent, children) in &hierarchy.parents {
        for to in children {
            for from in from_types.iter().filter(|f| **f != to.as_str()) {
                res.push(ParentCombination {
                    from: from.to_string(),
                    to: to.clone(),
                    parent: parent.clone(),
                });
            }
        }
    }
    res.sort();
    ParentCombinations {
        combinations: res,
        failures,
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    fn hierarchy() -> CellTypeHierarchy {
        let mut parents = BTreeMap::new();
        parents.insert(
            "tumour".to_string(),
            vec!["TumourA".to_string(), "TumourB".to_string()],
        );
        parents.insert(
            "immune".to_string(),
            vec!["Tcell".to_string(), "Bcell".to_string()],
        );
        CellTypeHierarchy::new(parents, &["TumourA", "TumourB", "Tcell", "Bcell", "Stroma"]).unwrap()
    }

    #[test]
    fn test_membership() {
        let h = hierarchy();
        assert_eq!(
            h.membership("Tcell").unwrap(),
            TypeMembership::Assigned(vec!["immune".to_string()])
        );
        assert_eq!(h.membership("Stroma").unwrap(), TypeMembership::Unassigned);
        assert_eq!(h.membership("Neuron").unwrap_err().kind(), "InvalidHierarchy");
    }

    #[test]
    fn test_unknown_child_is_rejected() {
        let mut parents = BTreeMap::new();
        parents.insert("p".to_string(), vec!["X".to_string()]);
        assert!(CellTypeHierarchy::new(parents, &["A"]).is_err());
    }

    #[test]
    fn test_parent_combinations() {
        let h = hierarchy();
        let res = parent_combinations(&["TumourA", "TumourB", "Tcell", "Bcell", "Stroma"], &h);
        assert!(res.failures.is_empty());
        let combos = res.combinations;
        // 4 children, each with the 4 other types as from
        assert_eq!(combos.len(), 16);
        assert!(combos.iter().all(|c| c.from != c.to));
        assert!(combos.windows(2).all(|w| w[0] < w[1]));
        assert!(combos
            .iter()
            .any(|c| c.column_name() == "Stroma__TumourA__tumour"));
        // the to type always lies within its parent
        for c in &combos {
            assert!(h.children(&c.parent).unwrap().contains(&c.to));
        }
    }

    #[test]
    fn test_unknown_type_is_skipped_and_reported() {
        let h = hierarchy();
        let known = ["TumourA", "TumourB", "Tcell", "Bcell", "Stroma"];
        let mut with_unknown = known.to_vec();
        with_unknown.push("Neuron");
        with_unknown.push("Neuron");

        let res = parent_combinations(&with_unknown, &h);
        assert_eq!(res.failures.len(), 1);
        assert_eq!(res.failures[0].kind(), "InvalidHierarchy");
        assert!(res.failures[0].to_string().contains("Neuron"));
        assert_eq!(res.combinations, parent_combinations(&known, &h).combinations);
        assert!(res.combinations.iter().all(|c| c.from != "Neuron"));
    }

    #[test]
    fn test_nested_parents() {
        let mut parents = BTreeMap::new();
        parents.insert("all".to_string(), vec!["A".to_string(), "B".to_string(), "C".to_string()]);
        parents.insert("ab".to_string(), vec!["A".to_string(), "B".to_string()]);
        let h = CellTypeHierarchy::new(parents, &["A", "B", "C"]).unwrap();
        assert_eq!(
            h.membership("A").unwrap(),
            TypeMembership::Assigned(vec!["ab".to_string(), "all".to_string()])
        );
        assert_eq!(h.unassigned().count(), 0);
    }
}
