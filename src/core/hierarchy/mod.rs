//! Module containing the cell type hierarchy (parent populations) and the
//! data driven hierarchy builder

pub mod builder;
pub mod cell_types;
