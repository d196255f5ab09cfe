//! Test helpers for broker tests.
//!
//! Provides store seeding helpers, a polling `eventually` helper, and
//! [`MockVendor`], an in-process HTTP server that behaves like an
//! asynchronous generation provider.

mod helpers;
mod mock_vendor;

pub use helpers::{eventually, seed_account, seed_model, simulated_input, vendor_input};
pub use mock_vendor::{MockVendor, ARTIFACT_BYTES};

pub use anyhow::Result;
