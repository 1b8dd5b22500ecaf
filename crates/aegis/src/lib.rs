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

//! Node self-healing core.
//!
//! One invocation targets one node: it reads the node's health signals from
//! the metrics backend, picks the most urgent fault, checks cluster-wide
//! admission, and hands the fault to the registered SOP while every step is
//! recorded on the node's ticket.

pub mod analysis;
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod gatekeeper;
pub mod healer;
pub mod sop;
pub mod status;
pub mod ticket;

#[cfg(test)]
pub(crate) mod test_utils;

pub use analysis::{AnalysisResult, Analyzer, Priority, PriorityTable};
pub use config::HealerConfig;
pub use error::{Error, Result};
pub use gatekeeper::GateKeeper;
pub use healer::{HealOutcome, NodeHealer};
pub use sop::{ApiBridge, Sop, SopRegistry};
pub use status::{NodeStatus, NodeStatusSource, StatusType};
pub use ticket::TicketManager;
