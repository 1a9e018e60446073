pub mod channel;
pub mod health;
pub mod message;
pub mod preference;
pub mod response;
pub mod retry;
pub mod rule;
pub mod status;
pub mod topology;
