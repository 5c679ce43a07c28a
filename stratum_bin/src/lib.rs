//! Workload driver for the stratum storage core.

pub mod workload;
