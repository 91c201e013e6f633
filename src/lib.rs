pub mod api;
pub mod config;
pub mod error;
pub mod generation;
pub mod models;
pub mod runtime;
pub mod state;
