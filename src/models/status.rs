use std::fmt::{Display, Formatter, Result};

use serde::{Deserialize, Serialize};

/// Terminal or intermediate state of a consumed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Delivered,
    Retrying,
    Failed,
    DeadLettered,
    Cancelled,
    Forwarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Unavailable,
}

impl Display for JobOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            JobOutcome::Delivered => write!(f, "delivered"),
            JobOutcome::Retrying => write!(f, "retrying"),
            JobOutcome::Failed => write!(f, "failed"),
            JobOutcome::DeadLettered => write!(f, "dead_lettered"),
            JobOutcome::Cancelled => write!(f, "cancelled"),
            JobOutcome::Forwarded => write!(f, "forwarded"),
        }
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Unavailable => write!(f, "unavailable"),
        }
    }
}
