//! Module containing the point pattern engine: observation windows and edge
//! corrections, neighbour lists, kernel intensities, the K/L-function and
//! its context aware variant

pub mod density;
pub mod kontextual;
pub mod neighbours;
pub mod point_pattern;
pub mod window;
