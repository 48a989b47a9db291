//! Shared helpers: vector utilities and assertion macros.

pub mod general;
pub mod macros;
#[cfg(feature = "r")]
pub mod r_rust_interface;
