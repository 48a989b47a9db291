//! Everything related to the Rust <> R interface.

pub mod r_association;
pub mod r_spatial;
