//! Network launcher.
//!
//! Starts one registry, `relays` onion routers and `users` user agents on a
//! [`Fabric`], in that order, so routers can register and users find a
//! populated directory. Router `n` listens at `relay_base + n`, user `n` at
//! `user_base + n`.

use std::sync::Arc;

use shallot_crypto::rsa_oaep::KeyPair;
use shallot_transport::{Fabric, ServiceHandle};
use shallot_types::{NodeId, PortLayout, UserId};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::LaunchConfig;
use crate::events::{Event, EventBus};
use crate::registry::RegistryService;
use crate::router::{generate_keys, RouterService};
use crate::user::UserService;
use crate::{DaemonError, Result};

/// A launched network. Services keep running until [`RunningNetwork::shutdown`].
pub struct RunningNetwork<F: Fabric> {
    layout: PortLayout,
    registry: Arc<RegistryService>,
    routers: Vec<Arc<RouterService<F::Client>>>,
    users: Vec<Arc<UserService<F::Client>>>,
    handles: Vec<ServiceHandle>,
    events: EventBus,
}

impl<F: Fabric> RunningNetwork<F> {
    pub fn layout(&self) -> PortLayout {
        self.layout
    }

    pub fn registry(&self) -> &Arc<RegistryService> {
        &self.registry
    }

    pub fn routers(&self) -> &[Arc<RouterService<F::Client>>] {
        &self.routers
    }

    pub fn users(&self) -> &[Arc<UserService<F::Client>>] {
        &self.users
    }

    pub fn router(&self, id: NodeId) -> Option<&Arc<RouterService<F::Client>>> {
        self.routers.get(usize::try_from(id).ok()?)
    }

    pub fn user(&self, id: UserId) -> Option<&Arc<UserService<F::Client>>> {
        self.users.get(usize::try_from(id).ok()?)
    }

    /// Stop every service, users first and registry last.
    pub async fn shutdown(self) {
        stop_all(self.handles).await;
        self.events
            .emit(Event::now("NetworkStopped", serde_json::json!({})));
        info!("Network stopped");
    }
}

impl<F: Fabric> std::fmt::Debug for RunningNetwork<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningNetwork")
            .field("layout", &self.layout)
            .field("routers", &self.routers.len())
            .field("users", &self.users.len())
            .finish_non_exhaustive()
    }
}

/// Start a registry, routers and users on `fabric`.
///
/// A router whose registration fails keeps running but is absent from the
/// directory; the failure is logged and not retried. Any other failure stops
/// whatever was already started and is returned.
pub async fn launch_network<F: Fabric>(
    fabric: &F,
    layout: PortLayout,
    launch: &LaunchConfig,
    events: EventBus,
) -> Result<RunningNetwork<F>> {
    // Key generation dominates start-up, so do it all up front and in parallel.
    let keys = generate_router_keys(launch.relays).await?;

    let mut handles = Vec::new();
    match start_services(fabric, layout, launch, keys, &events, &mut handles).await {
        Ok((registry, routers, users)) => {
            events.emit(Event::now(
                "NetworkLaunched",
                serde_json::json!({ "relays": routers.len(), "users": users.len() }),
            ));
            info!(
                relays = routers.len(),
                users = users.len(),
                registry = %layout.registry_address(),
                "Network launched"
            );
            Ok(RunningNetwork {
                layout,
                registry,
                routers,
                users,
                handles,
                events,
            })
        }
        Err(e) => {
            warn!(error = %e, "Launch failed, stopping started services");
            stop_all(handles).await;
            Err(e)
        }
    }
}

type Started<C> = (
    Arc<RegistryService>,
    Vec<Arc<RouterService<C>>>,
    Vec<Arc<UserService<C>>>,
);

async fn start_services<F: Fabric>(
    fabric: &F,
    layout: PortLayout,
    launch: &LaunchConfig,
    keys: Vec<KeyPair>,
    events: &EventBus,
    handles: &mut Vec<ServiceHandle>,
) -> Result<Started<F::Client>> {
    let registry_address = layout.registry_address();
    let registry = Arc::new(RegistryService::new());
    let client = fabric.open(registry_address)?;
    handles.push(fabric.serve(&client, registry_address, Arc::clone(&registry)).await?);

    let mut routers = Vec::with_capacity(keys.len());
    for (node_id, keys) in (0..).zip(keys) {
        let address = layout.relay_address(node_id)?;
        let client = fabric.open(address)?;
        let router = Arc::new(RouterService::new(
            node_id,
            keys,
            client.clone(),
            layout,
            events.clone(),
        ));
        handles.push(fabric.serve(&client, address, Arc::clone(&router)).await?);

        match router.register().await {
            Ok(()) => events.emit(Event::now(
                "RelayRegistered",
                serde_json::json!({ "nodeId": node_id }),
            )),
            Err(e) => warn!(node_id, error = %e, "Registration failed, router is unlisted"),
        }
        routers.push(router);
    }

    let mut users = Vec::new();
    for user_id in 0..launch.users {
        let address = layout.user_address(user_id)?;
        let client = fabric.open(address)?;
        let user = Arc::new(UserService::new(
            user_id,
            client.clone(),
            layout,
            launch.circuit_length,
            events.clone(),
        ));
        handles.push(fabric.serve(&client, address, Arc::clone(&user)).await?);
        users.push(user);
    }

    Ok((registry, routers, users))
}

async fn generate_router_keys(count: u32) -> Result<Vec<KeyPair>> {
    let tasks: Vec<JoinHandle<Result<KeyPair>>> =
        (0..count).map(|_| tokio::spawn(generate_keys())).collect();
    let mut keys = Vec::with_capacity(tasks.len());
    for task in tasks {
        keys.push(task.await.map_err(|e| DaemonError::Task(e.to_string()))??);
    }
    Ok(keys)
}

async fn stop_all(handles: Vec<ServiceHandle>) {
    for handle in handles.into_iter().rev() {
        handle.stop().await;
    }
}
