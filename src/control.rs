//! The control adapter: translates discrete actions from the provisioning
//! layer into routing table mutations.

use crate::routes::RoutingTable;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

/// What a control action asks the table to do.
///
/// Unrecognized kinds deserialize to `Unknown` so a misbehaving producer is
/// rejected at apply time instead of poisoning the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    Add,
    Remove,
    #[serde(other)]
    Unknown,
}

/// One discrete control action emitted by the provisioning layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteAction {
    pub kind: ActionKind,
    pub subdomain: String,
    /// Backend address; ignored for Remove
    #[serde(default)]
    pub ip_address: String,
    /// Backend-side target port; ignored for Remove
    #[serde(default)]
    pub port: u16,
}

/// Apply one action to the routing table.
///
/// Invalid actions (unknown kind, malformed address) are logged and leave
/// the table untouched; the caller keeps running either way.
pub fn apply(table: &RoutingTable, action: &RouteAction) {
    match action.kind {
        ActionKind::Add => {
            if let Err(e) = table.add(&action.subdomain, &action.ip_address, action.port) {
                error!(
                    subdomain = %action.subdomain,
                    address = %action.ip_address,
                    port = action.port,
                    error = %e,
                    "Rejected add action"
                );
            }
        }
        ActionKind::Remove => {
            table.remove(&action.subdomain);
        }
        ActionKind::Unknown => {
            error!(subdomain = %action.subdomain, "Unknown control action kind");
        }
    }
}

/// Drain control actions from the channel until it closes or shutdown is
/// signalled.
pub async fn run(
    table: Arc<RoutingTable>,
    mut actions: mpsc::Receiver<RouteAction>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            action = actions.recv() => {
                match action {
                    Some(action) => apply(&table, &action),
                    None => {
                        info!("Control channel closed");
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Control loop shutting down");
                    break;
                }
            }
        }
    }
}
