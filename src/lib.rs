pub mod alert;
pub mod api;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod finalize;
pub mod geo;
pub mod models;
pub mod observability;
pub mod state;
pub mod store;
pub mod sync;
pub mod tracking;
