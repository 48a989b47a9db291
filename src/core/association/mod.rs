//! Module containing the image by pair association table, the per image
//! weights and the outcome models (weighted least squares, random intercept
//! mixed models and Cox regression).

pub mod cox;
pub mod lm;
pub mod outcome;
pub mod table;
pub mod weights;
