//! Module containing the cell table, per image views and synthetic point
//! patterns

pub mod cells;
pub mod synthetic_data;
