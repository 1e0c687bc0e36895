//! The `hsmutil` command line client.

pub mod options;
pub mod report;
