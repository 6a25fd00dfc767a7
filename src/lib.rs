//! KULTA updater: release self-update controller
//!
//! Decides which tracked release becomes the cluster's active version and when,
//! honouring update windows, canary waves, notification lead time, manual and
//! disruption approval, cooldowns and step-by-step minor upgrades.

pub mod controller;
pub mod crd;
pub mod server;
