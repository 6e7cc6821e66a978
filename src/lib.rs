//! # pvebox — ephemeral Proxmox VE sandboxes
//!
//! Facade crate that re-exports the pvebox workspace crates so consumers
//! can depend on a single `pvebox` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | pvebox-core | Types, config, naming, errors, retry policy |
//! | [`api`] | pvebox-api | Authenticated transport, task sync, storage |
//! | [`runtime`] | pvebox-runtime | SDN allocation, VM lifecycle, guest exec |

pub use pvebox_api as api;
pub use pvebox_core as core;
pub use pvebox_runtime as runtime;
