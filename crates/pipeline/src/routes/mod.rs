//! API routes

pub mod alerts;
pub mod devices;
pub mod flush;
