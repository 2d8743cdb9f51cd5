//! Database models.

pub mod installation;

pub use installation::*;
