//! portal-tunnel command line

pub mod cli;
pub mod expose;
