//! Configuration, logging and inspection tools for lnwatch

pub mod config;
pub mod util;
