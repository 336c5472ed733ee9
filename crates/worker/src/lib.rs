//! `jobworks-worker`: the worker process binary and its wiring.

pub mod app;
pub mod config;
pub mod entry;
pub mod jobs;
