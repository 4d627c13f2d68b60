//! Pipeline worker runtime
//!
//! `runner` wires the broker, stage handlers, schedule and failure notifier
//! together; `http` streams story assets to disk for the download stage.

pub mod http;
pub mod runner;

pub use runner::{Collaborators, Pipeline, PipelineError};
