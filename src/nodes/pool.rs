use futures::future;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::hash_map::{Entry, HashMap};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use super::{ConnectionEvent, LoadBalancer, LowestLoad, Node, NodeConfig, SelectionHints};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use crate::config::PoolConfig;
use crate::event_handler::NodeEvent;
use crate::link::Link;
use crate::model::{self, Inbound};
use crate::{Error, Result};

struct Registered {
    node: Arc<Node>,
    events: UnboundedSender<ConnectionEvent>,
}

/// State shared between the pool handle, its node drivers and its links.
pub(crate) struct Shared {
    config: Arc<PoolConfig>,
    balancer: Box<dyn LoadBalancer>,
    nodes: RwLock<IndexMap<String, Registered>>,
    links: RwLock<HashMap<u64, Arc<Link>>>,
}

impl Shared {
    pub(crate) fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.read().get(name).map(|registered| Arc::clone(&registered.node))
    }

    /// Asks the balancer for a connected node that isn't excluded.
    pub(crate) fn select_node(&self, excluding: &HashSet<String>, hints: &SelectionHints) -> Result<Arc<Node>> {
        let candidates = self.nodes
            .read()
            .values()
            .map(|registered| &registered.node)
            .filter(|node| node.is_available() && !excluding.contains(node.name()))
            .cloned()
            .collect::<Vec<_>>();

        self.balancer
            .select_node(&candidates, hints)
            .ok_or(Error::NoNodesAvailable)
    }

    /// Unregisters a link, unless the guild was registered to another one.
    pub(crate) fn forget_link(&self, link: &Link) {
        let mut links = self.links.write();
        let registered = links
            .get(&link.guild_id())
            .map_or(false, |registered| std::ptr::eq(Arc::as_ptr(registered), link));

        if registered {
            links.remove(&link.guild_id());
        }
    }

    fn links_on(&self, node: &Node) -> Vec<Arc<Link>> {
        self.links
            .read()
            .values()
            .filter(|link| link.is_bound_to(node))
            .cloned()
            .collect()
    }

    /// The link a message from a node is meant for. Messages for links bound
    /// to another node are stale.
    fn routed_link(&self, node: &Node, guild_id: &str) -> Result<Option<Arc<Link>>> {
        let guild_id = model::parse_guild_id(guild_id)?;
        let link = self.links.read().get(&guild_id).cloned();

        Ok(link.filter(|link| link.is_bound_to(node)))
    }
}

/// The nodes of one client, and the links routed across them.
///
/// Dropping the pool closes every node.
pub struct NodePool {
    shared: Arc<Shared>,
}

impl NodePool {
    /// Creates an empty pool balancing by lowest load.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_balancer(config, LowestLoad)
    }

    pub fn with_balancer(config: PoolConfig, balancer: impl LoadBalancer + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                config: Arc::new(config),
                balancer: Box::new(balancer),
                nodes: RwLock::new(IndexMap::new()),
                links: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Registers a node and starts connecting to it.
    ///
    /// The node becomes selectable once its session is ready. Must be called
    /// from within a Tokio runtime.
    pub fn add_node(&self, config: NodeConfig) -> Result<Arc<Node>> {
        let mut nodes = self.shared.nodes.write();

        if nodes.contains_key(&config.name) {
            return Err(Error::NodeAlreadyExists(config.name));
        }

        let node = Arc::new(Node::new(config, Arc::clone(&self.shared.config)));
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(drive(Arc::downgrade(&self.shared), Arc::clone(&node), rx));
        node.connect(tx.clone());

        nodes.insert(node.name().to_owned(), Registered {
            node: Arc::clone(&node),
            events: tx,
        });

        info!("Added node {}", node.name());

        Ok(node)
    }

    /// Closes and unregisters a node, then moves every link bound to it
    /// elsewhere.
    ///
    /// Resolves once all those migrations finished. Links that couldn't be
    /// moved are reported through their own event streams.
    pub async fn remove_node(&self, name: &str) -> Result<()> {
        let registered = self.shared.nodes
            .write()
            .shift_remove(name)
            .ok_or_else(|| Error::NodeNotFound(name.to_owned()))?;
        let node = registered.node;

        node.close();

        let migrations = self.shared
            .links_on(&node)
            .into_iter()
            .map(|link| {
                let node = Arc::clone(&node);

                async move { link.migrate_from(node).await }
            });
        let failed = future::join_all(migrations)
            .await
            .into_iter()
            .filter(Result::is_err)
            .count();

        if failed > 0 {
            warn!("Removed node {}; {} link(s) could not be moved", name, failed);
        } else {
            info!("Removed node {}", name);
        }

        Ok(())
    }

    /// Drops a node's connection and opens a new one, resuming the session
    /// if it is still known.
    pub async fn reconnect_node(&self, name: &str) -> Result<()> {
        let (node, events) = {
            let nodes = self.shared.nodes.read();
            let registered = nodes
                .get(name)
                .ok_or_else(|| Error::NodeNotFound(name.to_owned()))?;

            (Arc::clone(&registered.node), registered.events.clone())
        };

        node.reconnect(events).await;

        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.shared.node(name)
    }

    /// Every registered node, in registration order.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.shared.nodes
            .read()
            .values()
            .map(|registered| Arc::clone(&registered.node))
            .collect()
    }

    /// Picks the node a new link would be routed to.
    pub fn select_node(&self, hints: &SelectionHints) -> Result<Arc<Node>> {
        self.shared.select_node(&HashSet::new(), hints)
    }

    /// Like [`select_node`], skipping the named nodes.
    ///
    /// [`select_node`]: #method.select_node
    pub fn select_node_excluding(&self, excluding: &HashSet<String>, hints: &SelectionHints) -> Result<Arc<Node>> {
        self.shared.select_node(excluding, hints)
    }

    /// Creates the link of a guild. Fails if the guild already has one.
    pub fn create_link(&self, guild_id: u64) -> Result<Arc<Link>> {
        match self.shared.links.write().entry(guild_id) {
            Entry::Occupied(_) => Err(Error::LinkAlreadyExists(guild_id)),
            Entry::Vacant(entry) => Ok(Arc::clone(entry.insert(self.new_link(guild_id)))),
        }
    }

    pub fn get_or_create_link(&self, guild_id: u64) -> Arc<Link> {
        let mut links = self.shared.links.write();
        let link = links.entry(guild_id).or_insert_with(|| self.new_link(guild_id));

        Arc::clone(link)
    }

    pub fn link(&self, guild_id: u64) -> Option<Arc<Link>> {
        self.shared.links.read().get(&guild_id).cloned()
    }

    pub fn links(&self) -> Vec<Arc<Link>> {
        self.shared.links.read().values().cloned().collect()
    }

    /// The links currently bound to the named node.
    pub fn links_on(&self, name: &str) -> Vec<Arc<Link>> {
        match self.node(name) {
            Some(node) => self.shared.links_on(&node),
            None => Vec::new(),
        }
    }

    /// Destroys a guild's link, if it has one.
    pub async fn destroy_link(&self, guild_id: u64) -> Result<()> {
        match self.link(guild_id) {
            Some(link) => link.destroy().await,
            None => Ok(()),
        }
    }

    /// Closes every node's connection. Links stay registered.
    pub fn close(&self) {
        for registered in self.shared.nodes.read().values() {
            registered.node.close();
        }
    }

    fn new_link(&self, guild_id: u64) -> Arc<Link> {
        Arc::new(Link::new(
            guild_id,
            Arc::downgrade(&self.shared),
            Arc::clone(&self.shared.config),
        ))
    }
}

impl Drop for NodePool {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for NodePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePool")
            .field("nodes", &self.nodes())
            .field("links", &self.shared.links.read().len())
            .field("balancer", &self.shared.balancer)
            .finish()
    }
}

/// Applies one node's connection events in the order they were received.
async fn drive(pool: Weak<Shared>, node: Arc<Node>, mut events: UnboundedReceiver<ConnectionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(pool) = pool.upgrade() else {
            break;
        };

        match event {
            ConnectionEvent::Inbound(Inbound::Ready(ready)) => {
                node.mark_ready(&ready);

                if let Some(timeout) = pool.config.resume_timeout {
                    let node = Arc::clone(&node);

                    tokio::spawn(async move {
                        if let Err(why) = node.configure_resuming(timeout).await {
                            warn!("[{}] Failed to configure resuming: {}", node.name(), why);
                        }
                    });
                }

                if !ready.resumed {
                    for link in pool.links_on(&node) {
                        let node = Arc::clone(&node);

                        tokio::spawn(async move { link.resync(node).await });
                    }
                }
            },
            ConnectionEvent::Inbound(Inbound::Stats(stats)) => node.update_stats(stats),
            ConnectionEvent::Inbound(Inbound::PlayerUpdate(update)) => {
                match pool.routed_link(&node, &update.guild_id) {
                    Ok(Some(link)) => link.handle_player_update(update.state),
                    Ok(None) => trace!("[{}] No link for player update of {}", node.name(), update.guild_id),
                    Err(why) => protocol_error(&node, why),
                }
            },
            ConnectionEvent::Inbound(Inbound::Event(event)) => {
                match pool.routed_link(&node, event.guild_id()) {
                    Ok(Some(link)) => link.handle_event(event),
                    Ok(None) => trace!("[{}] No link for event {:?}", node.name(), event),
                    Err(why) => protocol_error(&node, why),
                }
            },
            ConnectionEvent::ProtocolError(why) => protocol_error(&node, why),
            ConnectionEvent::Disconnected { code, reason } => node.mark_reconnecting(code, reason),
            ConnectionEvent::Lost(why) => {
                node.mark_unavailable(why);

                for link in pool.links_on(&node) {
                    let node = Arc::clone(&node);

                    tokio::spawn(async move {
                        let _ = link.migrate_from(node).await;
                    });
                }
            },
        }
    }

    debug!("[{}] Event driver stopped", node.name());
}

fn protocol_error(node: &Node, error: Error) {
    node.events().dispatch(&NodeEvent::ProtocolError {
        node: node.name().to_owned(),
        error: Arc::new(error),
    });
}
