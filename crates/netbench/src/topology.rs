//! A materialized topology.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument};

use crate::fabric::LinkFabric;
use crate::node::{Link, Node};

/// A teardown step that failed for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeTeardownError {
    /// Node (or link) the step belonged to.
    pub node: String,
    /// Error message.
    pub message: String,
}

impl fmt::Display for NodeTeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.node, self.message)
    }
}

/// What a fabric release pass removed and what it could not.
#[derive(Debug, Default)]
pub(crate) struct ReleaseOutcome {
    pub links: Vec<String>,
    pub errors: Vec<NodeTeardownError>,
}

/// Tears down `links`, then destroys `created`, both in reverse creation
/// order. Errors are collected and never stop the pass.
pub(crate) async fn release_resources(
    fabric: &dyn LinkFabric,
    nodes: &BTreeMap<String, Node>,
    created: &[&Node],
    links: &[&Link],
) -> ReleaseOutcome {
    let mut outcome = ReleaseOutcome::default();

    for link in links.iter().rev() {
        let a_ns = nodes.get(&link.a.node).and_then(Node::namespace);
        match fabric.teardown_link(link, a_ns).await {
            Ok(()) => outcome.links.push(link.to_string()),
            Err(e) => outcome.errors.push(NodeTeardownError {
                node: link.to_string(),
                message: e.to_string(),
            }),
        }
    }
    for node in created.iter().rev() {
        if let Err(e) = fabric.destroy_node(node).await {
            outcome.errors.push(NodeTeardownError {
                node: node.name.clone(),
                message: e.to_string(),
            });
        }
    }
    outcome
}

/// Topology whose nodes and links exist on a fabric.
///
/// Holds the fabric handle it was built on; [`Topology::release`] gives the
/// resources back.
pub struct Topology {
    nodes: BTreeMap<String, Node>,
    order: Vec<String>,
    links: Vec<Link>,
    fabric: Arc<dyn LinkFabric>,
    released: bool,
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("nodes", &self.order)
            .field("links", &self.links.len())
            .field("fabric", &self.fabric.name())
            .field("released", &self.released)
            .finish()
    }
}

impl Topology {
    pub(crate) fn new(
        nodes: BTreeMap<String, Node>,
        order: Vec<String>,
        links: Vec<Link>,
        fabric: Arc<dyn LinkFabric>,
    ) -> Self {
        Self {
            nodes,
            order,
            links,
            fabric,
            released: false,
        }
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|n| self.nodes.get(n))
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Node> {
        self.nodes().filter(|n| n.is_host())
    }

    pub fn switches(&self) -> impl Iterator<Item = &Node> {
        self.nodes().filter(|n| !n.is_host())
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn fabric(&self) -> &Arc<dyn LinkFabric> {
        &self.fabric
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Removes every link and node from the fabric. Subsequent calls do
    /// nothing.
    #[instrument(skip(self), fields(fabric = self.fabric.name()))]
    pub(crate) async fn release(&mut self) -> ReleaseOutcome {
        if self.released {
            return ReleaseOutcome::default();
        }
        self.released = true;

        let nodes: Vec<&Node> = self.nodes().collect();
        let links: Vec<&Link> = self.links.iter().collect();
        let outcome =
            release_resources(self.fabric.as_ref(), &self.nodes, &nodes, &links).await;
        debug!(
            links = outcome.links.len(),
            errors = outcome.errors.len(),
            "Released fabric resources"
        );
        outcome
    }
}
