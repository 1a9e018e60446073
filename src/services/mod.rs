pub mod consumer;
pub mod engine;
pub mod preferences;
pub mod publisher;
pub mod rules;
pub mod worker;
