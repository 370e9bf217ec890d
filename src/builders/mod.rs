//! Builders to assemble the runtime from configuration.

pub mod switchyard_builder;

pub use switchyard_builder::build_switchyard;
