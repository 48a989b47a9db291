//! Context-aware spatial co-localisation for multiplexed tissue images.
//!
//! Cells of an image are treated as a marked point pattern. For a pair of
//! cell types the crate computes a Besag L-function deviation, optionally
//! relative to a parent population of the neighbouring type (Kontextual),
//! aggregates it into an image by pair table, weights images by their cell
//! counts and associates the table with clinical outcomes.

pub mod core;
pub mod error;
pub mod utils;

#[cfg(feature = "r")]
mod r_bindings;

pub use crate::core::association::outcome::{
    fit_outcome_association, Covariates, ModelKind, Outcome, OutcomeModelResult, OutcomeParams, SurvivalTime,
};
pub use crate::core::association::table::{
    build_association_table, AssociationBatch, AssociationTable, BatchFailure, BatchParams, CountTable, PairSpec,
};
pub use crate::core::association::weights::{fit_weights, WeightMode, WeightParams, WeightTable};
pub use crate::core::data::cells::{CellColumns, CellTable, ImageCells, MarkerProfiles};
pub use crate::core::hierarchy::builder::{build_hierarchy, HierarchyParams, LinkageDistance, TreeCut};
pub use crate::core::hierarchy::cell_types::{
    parent_combinations, CellTypeHierarchy, ParentCombination, ParentCombinations, ParentSpec,
};
pub use crate::core::spatial::kontextual::{kontext_curve, kontextual, KontextualRes};
pub use crate::core::spatial::point_pattern::{point_pattern_statistic, LCurve, PointPatternParams};
pub use crate::core::spatial::window::{EdgeCorrection, Rect, WindowKind};
pub use crate::error::{Result, SpatialError};

#[cfg(feature = "r")]
use extendr_api::prelude::*;
#[cfg(feature = "r")]
use r_bindings::{r_association, r_spatial};

#[cfg(feature = "r")]
extendr_module! {
    mod kontextual;
    use r_spatial;
    use r_association;
}
