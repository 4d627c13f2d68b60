//! Operator HTTP API: health, job inspection, stats and manual fetch trigger

mod error;
pub mod models;
mod server;
pub mod services;
pub mod state;

pub use error::ApiError;
pub use server::{router, serve};
