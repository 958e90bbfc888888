pub mod api;
pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod geo;
pub mod messaging;
pub mod models;
pub mod observability;
pub mod registry;
pub mod session;
pub mod state;
