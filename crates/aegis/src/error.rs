//! Crate-wide error type.

use thiserror::Error;

use crate::analysis::PriorityError;
use crate::config::ConfigError;
use crate::healer::lease::LeaseError;
use crate::sop::SopError;
use crate::status::StatusError;
use crate::ticket::TicketError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("metrics backend: {0}")]
    Status(#[from] StatusError),

    #[error("priority config: {0}")]
    Priority(#[from] PriorityError),

    #[error("ticket: {0}")]
    Ticket(#[from] TicketError),

    #[error("sop: {0}")]
    Sop(#[from] SopError),

    #[error("leader election: {0}")]
    Lease(#[from] LeaseError),

    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("node {0} not found")]
    NodeNotFound(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
