/*
 * Aegis - Node Self-Healing for GPU Clusters
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Aegis command line.
//!
//! `aegis selfhealing node <NAME>` runs one self-healing pass against one
//! node, optionally under a per-node Lease.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use aegis::cluster::{KubeNodeOps, NodeOps};
use aegis::config::{HealerConfig, RegistrySettings, TicketSystem};
use aegis::events::{EventSink, KubeEventSink};
use aegis::healer::lease::{with_node_lease, LeaseConfig};
use aegis::status::{NodeStatusSource, PrometheusConfig, PrometheusStatusSource};
use aegis::ticket::{
    NodeTicketStore, ScitixClient, ScitixTicketStore, TicketBackend, TicketManager,
    HEALER_SUPERVISOR,
};
use aegis::{ApiBridge, NodeHealer, SopRegistry};

/// Time allowed to wind down after SIGTERM before the process exits.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "aegis", version, about = "Node self-healing for GPU clusters")]
struct Cli {
    /// Path to a kubeconfig; in-cluster configuration when omitted
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    #[arg(long, global = true, default_value = "")]
    region: String,

    #[arg(long, global = true, default_value = "")]
    orgname: String,

    #[arg(long, global = true, default_value = "")]
    clustername: String,

    /// Run the body only while holding the node's Lease
    #[arg(long, global = true)]
    enable_leader_election: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[arg(long, global = true, env = "PROMETHEUS_URL")]
    prometheus_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Self-healing entrypoints
    Selfhealing {
        #[command(subcommand)]
        target: SelfHealingTarget,
    },
}

#[derive(Subcommand)]
enum SelfHealingTarget {
    /// Heal one node
    Node(NodeArgs),
}

#[derive(Args)]
struct NodeArgs {
    /// Node name; any dot-suffix is stripped
    name: String,

    /// Only consider statuses of this category
    #[arg(long = "type", default_value = "")]
    type_filter: String,

    #[arg(long, default_value = "/etc/aegis/selfhealing/priority")]
    priority_config: PathBuf,

    /// Remediation aggressiveness passed to SOPs
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    level: i32,

    /// Record a ticket for the selected status without running an SOP
    #[arg(long = "ticket.only")]
    ticket_only: bool,

    #[arg(long = "ticket.system", value_enum, default_value_t = TicketSystem::Node)]
    ticket_system: TicketSystem,

    #[arg(long, default_value = "")]
    ops_image: String,

    #[arg(long, default_value = "")]
    base_ops_image: String,

    #[arg(long, default_value = "")]
    registry: String,

    #[arg(long, default_value = "")]
    repository: String,

    /// Condition that is cordoned and escalated to SRE (repeatable)
    #[arg(long = "escalate-condition")]
    escalate_conditions: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Starting aegis v{}", env!("CARGO_PKG_VERSION"));

    let Command::Selfhealing {
        target: SelfHealingTarget::Node(args),
    } = cli.command;

    heal_node(
        args,
        cli.kubeconfig.as_deref(),
        cli.region,
        cli.orgname,
        cli.clustername,
        cli.enable_leader_election,
        cli.prometheus_url,
    )
    .await
}

fn init_tracing(json: bool) {
    let registry = tracing_subscriber::registry().with(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,aegis=debug".into()),
    );
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn kube_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let Some(path) = kubeconfig else {
        return Client::try_default()
            .await
            .context("failed to build Kubernetes client");
    };

    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("invalid kubeconfig")?;
    Client::try_from(config).context("failed to build Kubernetes client")
}

async fn heal_node(
    args: NodeArgs,
    kubeconfig: Option<&Path>,
    region: String,
    org_name: String,
    cluster_name: String,
    leader_election: bool,
    prometheus_url: Option<String>,
) -> Result<()> {
    let mut config = HealerConfig::new(&args.name, args.priority_config);
    config.region = region;
    config.org_name = org_name;
    config.cluster_name = cluster_name;
    config.type_filter = args.type_filter;
    config.level = args.level;
    config.ticket_only = args.ticket_only;
    config.ticket_system = args.ticket_system;
    config.registry = RegistrySettings {
        ops_image: args.ops_image,
        base_ops_image: args.base_ops_image,
        registry: args.registry,
        repository: args.repository,
    };
    config.escalate_conditions = args.escalate_conditions;
    let config = config
        .with_env(leader_election)
        .context("failed to read configuration from the environment")?;
    config.validate()?;

    let client = kube_client(kubeconfig).await?;
    info!("Connected to Kubernetes cluster");

    let nodes: Arc<dyn NodeOps> = Arc::new(KubeNodeOps::new(client.clone()));
    let node = nodes
        .get_node(&config.node)
        .await
        .with_context(|| format!("failed to get node {}", config.node))?;
    let prometheus = match prometheus_url {
        Some(base_url) => PrometheusConfig {
            base_url,
            ..PrometheusConfig::default()
        },
        None => PrometheusConfig::default(),
    };
    let statuses: Arc<dyn NodeStatusSource> = Arc::new(
        PrometheusStatusSource::new(prometheus).context("failed to build metrics client")?,
    );

    let backend = match config.ticket_system {
        TicketSystem::Node => TicketBackend::Node(NodeTicketStore::new(&config.node, nodes.clone())),
        TicketSystem::Scitix => {
            let client = ScitixClient::from_env().context("ticket service is not configured")?;
            let store = ScitixTicketStore::for_node(
                client,
                &config.region,
                &config.org_name,
                &node,
                HEALER_SUPERVISOR,
            )
            .await
            .with_context(|| format!("failed to resolve node {} on the ticket service", config.node))?;
            TicketBackend::Scitix(store)
        }
        TicketSystem::Disabled => TicketBackend::Disabled,
    };
    let tickets = TicketManager::new(&config.node, backend).with_sre_routing(config.sre_routing.clone());
    info!(backend = tickets.backend_name(), node = %config.node, "Ticket manager ready");

    let events: Arc<dyn EventSink> = Arc::new(KubeEventSink::new(
        client.clone(),
        config.lease.as_ref().map(|lease| lease.holder.clone()),
        config.correlation.clone(),
    ));

    let bridge = Arc::new(ApiBridge {
        cluster_name: config.cluster_name.clone(),
        region: config.region.clone(),
        org_name: config.org_name.clone(),
        nodes,
        statuses,
        tickets: Arc::new(tokio::sync::Mutex::new(tickets)),
        events,
        level: config.level,
        registry: config.registry.clone(),
    });
    let healer = NodeHealer::new(&config, bridge, SopRegistry::builtin(&config.escalate_conditions));

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            shutdown_signal().await;
            token.cancel();
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            warn!("Shutdown grace period elapsed, exiting");
            std::process::exit(1);
        }
    });

    let result = match &config.lease {
        Some(identity) => {
            with_node_lease(
                client,
                &config.node,
                LeaseConfig::from(identity),
                token.clone(),
                || healer.heal(),
            )
            .await?
        }
        None => tokio::select! {
            result = healer.heal() => Some(result),
            () = token.cancelled() => None,
        },
    };

    match result {
        Some(result) => {
            let outcome = result.with_context(|| format!("self-healing of {} failed", config.node))?;
            info!(node = %config.node, outcome = %outcome, "Self-healing complete");
        }
        None => info!(node = %config.node, "Cancelled before self-healing completed"),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
