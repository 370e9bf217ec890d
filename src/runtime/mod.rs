//! The assembled runtime and its API-facing snapshot types.

pub mod api;
pub mod switchyard;

pub use api::{health, snapshot, Health, SwitchyardSnapshot};
pub use switchyard::Switchyard;
