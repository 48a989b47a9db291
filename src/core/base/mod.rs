//! Module containing the base statistics: distribution based p-values, FDR
//! adjustment, weighted least squares and isotonic regression.

pub mod isotonic;
pub mod linear_algebra;
pub mod stats;
