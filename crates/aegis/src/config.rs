//! Healer configuration assembled from the command line and environment.

use std::path::PathBuf;

use clap::ValueEnum;
use thiserror::Error;

use crate::cluster::short_node_name;
use crate::events::AlertCorrelation;
use crate::ticket::SreRouting;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    MissingEnv(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Backend persisting the node's ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum TicketSystem {
    /// Node annotation
    #[default]
    #[value(name = "Node")]
    Node,
    /// Remote ticketing service
    #[value(name = "Scitix")]
    Scitix,
    /// In memory only
    #[value(name = "Disabled")]
    Disabled,
}

/// Container registry settings handed to SOPs that launch ops pods.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySettings {
    pub ops_image: String,
    pub base_ops_image: String,
    pub registry: String,
    pub repository: String,
}

/// Identity used for per-node leader election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseIdentity {
    pub namespace: String,
    pub holder: String,
}

impl LeaseIdentity {
    /// From `POD_NAMESPACE` and `POD_NAME`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let read = |key: &str| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ConfigError::MissingEnv(key.to_string()))
        };
        Ok(Self {
            namespace: read("POD_NAMESPACE")?,
            holder: read("POD_NAME")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HealerConfig {
    /// Target node, already stripped of any dot-suffix
    pub node: String,
    pub region: String,
    pub org_name: String,
    pub cluster_name: String,
    /// Status category filter; empty means all
    pub type_filter: String,
    pub priority_config: PathBuf,
    /// Aggressiveness passed through to SOPs
    pub level: i32,
    pub ticket_only: bool,
    pub ticket_system: TicketSystem,
    pub registry: RegistrySettings,
    /// Conditions escalated to SRE after a cordon
    pub escalate_conditions: Vec<String>,
    /// Set when leader election is enabled
    pub lease: Option<LeaseIdentity>,
    pub sre_routing: SreRouting,
    pub correlation: AlertCorrelation,
}

impl HealerConfig {
    pub fn new(node: &str, priority_config: impl Into<PathBuf>) -> Self {
        Self {
            node: short_node_name(node).to_string(),
            region: String::new(),
            org_name: String::new(),
            cluster_name: String::new(),
            type_filter: String::new(),
            priority_config: priority_config.into(),
            level: 0,
            ticket_only: false,
            ticket_system: TicketSystem::default(),
            registry: RegistrySettings::default(),
            escalate_conditions: Vec::new(),
            lease: None,
            sre_routing: SreRouting::default(),
            correlation: AlertCorrelation::default(),
        }
    }

    /// Fill in everything that comes from the process environment.
    pub fn with_env(mut self, leader_election: bool) -> Result<Self, ConfigError> {
        self.sre_routing = SreRouting::from_env();
        self.correlation = AlertCorrelation::from_env();
        self.lease = if leader_election {
            Some(LeaseIdentity::from_env()?)
        } else {
            None
        };
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.is_empty() {
            return Err(ConfigError::Invalid("node name is empty".to_string()));
        }
        if self.ticket_system == TicketSystem::Scitix
            && (self.region.is_empty() || self.org_name.is_empty())
        {
            return Err(ConfigError::Invalid(
                "the Scitix ticket system needs --region and --orgname".to_string(),
            ));
        }
        Ok(())
    }
}
