pub mod api;
pub mod broker;
pub mod clients;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod store;
pub mod utils;
