//! Core domain models for the worker
//!
//! This module defines pipeline definitions, run and step state, the records
//! read from the platform database, and the template context steps render
//! against.

pub mod context;
pub mod definition;
pub mod models;
pub mod state;
pub mod template;

pub use context::*;
pub use definition::*;
pub use models::*;
pub use state::*;
pub use template::{interpolate, TemplateError};
