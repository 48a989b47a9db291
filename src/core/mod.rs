pub mod association;
pub mod base;
pub mod data;
pub mod hierarchy;
pub mod spatial;
