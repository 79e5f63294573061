//! # arck-ctl
//!
//! Library half of the `arckctl` driver: self-checking stress runs over the
//! chained hash table and the lease protocol.

pub mod stress;

pub use stress::{run_lease_stress, run_table_stress, LeaseReport, LeaseStress, TableReport, TableStress};
