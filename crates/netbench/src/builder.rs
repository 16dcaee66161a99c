//! Topology description and construction.
//!
//! [`TopologyBuilder`] is a pure description: adding nodes and links
//! allocates names and interface ordinals but touches nothing on the host.
//! [`TopologyBuilder::build`] validates the description and is the single
//! place where emulation resources are allocated.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::endpoint::Endpoint;
use crate::error::{TestbedError, TestbedResult};
use crate::fabric::LinkFabric;
use crate::node::{Link, Node, SwitchSpec, MAX_INTERFACE_NAME_LEN};
use crate::topology::{release_resources, Topology};

/// Mutable description of a topology.
#[derive(Debug, Clone, Default)]
pub struct TopologyBuilder {
    nodes: BTreeMap<String, Node>,
    order: Vec<String>,
    links: Vec<Link>,
    interface_limit: Option<usize>,
    switches_declared: u64,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the number of interfaces per node.
    pub fn with_interface_limit(mut self, limit: usize) -> Self {
        self.interface_limit = Some(limit);
        self
    }

    /// Adds a host.
    pub fn add_host(&mut self, name: &str) -> TestbedResult<&Node> {
        self.insert(Node::host(name))
    }

    /// Adds a switch serving its data-plane configuration on `data_plane`.
    ///
    /// The device id defaults to the switch's 1-based declaration index.
    pub fn add_switch(&mut self, name: &str, data_plane: Endpoint) -> TestbedResult<&Node> {
        let device_id = self.switches_declared + 1;
        self.add_switch_spec(
            name,
            SwitchSpec {
                data_plane,
                device_id,
                controller: None,
            },
        )
    }

    /// Adds a switch with an explicit device id.
    pub fn add_switch_with_device_id(
        &mut self,
        name: &str,
        data_plane: Endpoint,
        device_id: u64,
    ) -> TestbedResult<&Node> {
        self.add_switch_spec(
            name,
            SwitchSpec {
                data_plane,
                device_id,
                controller: None,
            },
        )
    }

    /// Adds a switch from a [`SwitchSpec`], including a controller override.
    pub fn add_switch_spec(&mut self, name: &str, spec: SwitchSpec) -> TestbedResult<&Node> {
        if self.nodes.contains_key(name) {
            return Err(TestbedError::duplicate_name(name));
        }
        self.switches_declared += 1;
        self.insert(Node::switch(name, spec))
    }

    fn insert(&mut self, node: Node) -> TestbedResult<&Node> {
        if self.nodes.contains_key(&node.name) {
            return Err(TestbedError::duplicate_name(&node.name));
        }
        let name = node.name.clone();
        debug!(node = %name, kind = node.kind.label(), "Added node");
        self.order.push(name.clone());
        let node = self.nodes.entry(name).or_insert(node);
        Ok(&*node)
    }

    /// Links `a` and `b`, allocating one new interface on each.
    pub fn add_link(&mut self, a: &str, b: &str) -> TestbedResult<Link> {
        if a == b {
            return Err(TestbedError::InvalidLink {
                a: a.to_string(),
                b: b.to_string(),
                reason: "a node cannot link to itself".to_string(),
            });
        }
        for name in [a, b] {
            let node = self
                .nodes
                .get(name)
                .ok_or_else(|| TestbedError::unknown_node(name))?;
            if let Some(limit) = self.interface_limit {
                if node.interfaces.len() >= limit {
                    return Err(TestbedError::InterfaceExhaustion {
                        node: name.to_string(),
                        limit,
                    });
                }
            }
            let iface = node.next_interface_name();
            if iface.len() > MAX_INTERFACE_NAME_LEN {
                return Err(TestbedError::InvalidLink {
                    a: a.to_string(),
                    b: b.to_string(),
                    reason: format!(
                        "interface name '{}' is longer than {} characters",
                        iface, MAX_INTERFACE_NAME_LEN
                    ),
                });
            }
        }

        let a_iface = self
            .nodes
            .get_mut(a)
            .ok_or_else(|| TestbedError::unknown_node(a))?
            .allocate_interface();
        let b_iface = self
            .nodes
            .get_mut(b)
            .ok_or_else(|| TestbedError::unknown_node(b))?
            .allocate_interface();

        let link = Link::new(a_iface, b_iface);
        debug!(link = %link, "Added link");
        self.links.push(link.clone());
        Ok(link)
    }

    /// Removes a node from the description.
    ///
    /// Links touching the node are kept; [`TopologyBuilder::build`] reports
    /// them.
    pub fn remove_node(&mut self, name: &str) -> TestbedResult<Node> {
        let node = self
            .nodes
            .remove(name)
            .ok_or_else(|| TestbedError::unknown_node(name))?;
        self.order.retain(|n| n != name);
        Ok(node)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|n| self.nodes.get(n))
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Links whose endpoint interfaces are not owned by a present node.
    pub fn orphan_links(&self) -> Vec<&Link> {
        self.links
            .iter()
            .filter(|link| {
                link.ends().iter().any(|iface| {
                    self.nodes
                        .get(&iface.node)
                        .map_or(true, |node| !node.owns(iface))
                })
            })
            .collect()
    }

    /// Structural validation without allocating anything.
    pub fn validate(&self) -> TestbedResult<()> {
        let orphans = self.orphan_links();
        if orphans.is_empty() {
            return Ok(());
        }
        Err(TestbedError::IncompleteTopology {
            orphans: orphans.iter().map(|l| l.to_string()).collect(),
        })
    }

    /// Validates the description and materializes it on `fabric`.
    ///
    /// Nodes are created before links. If the fabric fails part-way,
    /// everything already created is released before the error is returned.
    #[instrument(skip(self, fabric), fields(fabric = fabric.name(), nodes = self.nodes.len(), links = self.links.len()))]
    pub async fn build(self, fabric: Arc<dyn LinkFabric>) -> TestbedResult<Topology> {
        self.validate()?;

        let nodes: Vec<&Node> = self.nodes().collect();
        let mut created_nodes: Vec<&Node> = Vec::with_capacity(nodes.len());
        let mut created_links: Vec<&Link> = Vec::with_capacity(self.links.len());

        let mut failure = None;
        for node in &nodes {
            match fabric.create_node(node).await {
                Ok(()) => created_nodes.push(*node),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if failure.is_none() {
            for link in &self.links {
                let a_ns = self.nodes.get(&link.a.node).and_then(Node::namespace);
                let b_ns = self.nodes.get(&link.b.node).and_then(Node::namespace);
                match fabric.create_link(link, a_ns, b_ns).await {
                    Ok(()) => created_links.push(link),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        if let Some(err) = failure {
            warn!(error = %err, "Materialization failed, rolling back");
            let outcome =
                release_resources(fabric.as_ref(), &self.nodes, &created_nodes, &created_links)
                    .await;
            for e in &outcome.errors {
                warn!(node = %e.node, "Rollback error: {}", e.message);
            }
            return Err(err);
        }

        info!(
            "Built topology with {} nodes and {} links",
            self.nodes.len(),
            self.links.len()
        );
        Ok(Topology::new(self.nodes, self.order, self.links, fabric))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{FabricEvent, SimFabric};
    use pretty_assertions::assert_eq;

    fn ep(port: u16) -> Endpoint {
        Endpoint::new("127.0.0.1", port)
    }

    #[test]
    fn test_duplicate_name() {
        let mut b = TopologyBuilder::new();
        b.add_host("h1").unwrap();
        assert!(matches!(
            b.add_host("h1"),
            Err(TestbedError::DuplicateName { .. })
        ));
        assert!(matches!(
            b.add_switch("h1", ep(50051)),
            Err(TestbedError::DuplicateName { .. })
        ));
    }

    #[test]
    fn test_device_ids_follow_switch_declaration() {
        let mut b = TopologyBuilder::new();
        b.add_host("h1").unwrap();
        b.add_switch("s1", ep(50051)).unwrap();
        b.add_switch_with_device_id("s2", ep(50052), 9).unwrap();
        b.add_switch("s3", ep(50053)).unwrap();

        let ids: Vec<u64> = b
            .nodes()
            .filter_map(|n| n.switch_spec().map(|s| s.device_id))
            .collect();
        assert_eq!(ids, vec![1, 9, 3]);
    }

    #[test]
    fn test_add_link_allocates_interfaces() {
        let mut b = TopologyBuilder::new();
        b.add_host("h1").unwrap();
        b.add_switch("s1", ep(50051)).unwrap();

        let link = b.add_link("s1", "h1").unwrap();
        assert_eq!(link.a.name, "s1-eth1");
        assert_eq!(link.b.name, "h1-eth0");
        assert_eq!(b.node("s1").unwrap().interfaces.len(), 1);
    }

    #[test]
    fn test_add_link_errors() {
        let mut b = TopologyBuilder::new().with_interface_limit(1);
        b.add_host("h1").unwrap();
        b.add_host("h2").unwrap();
        b.add_switch("s1", ep(50051)).unwrap();

        assert!(matches!(
            b.add_link("s1", "s1"),
            Err(TestbedError::InvalidLink { .. })
        ));
        assert!(matches!(
            b.add_link("s1", "h9"),
            Err(TestbedError::UnknownNode { .. })
        ));
        b.add_link("s1", "h1").unwrap();
        match b.add_link("s1", "h2") {
            Err(TestbedError::InterfaceExhaustion { node, limit }) => {
                assert_eq!(node, "s1");
                assert_eq!(limit, 1);
            }
            other => panic!("Expected InterfaceExhaustion, got {:?}", other),
        }
        // Nothing was allocated on h2 by the failed call
        assert!(b.node("h2").unwrap().interfaces.is_empty());
    }

    #[test]
    fn test_add_link_rejects_long_interface_names() {
        let mut b = TopologyBuilder::new();
        b.add_host("h1").unwrap();
        b.add_host("aggregation-h2").unwrap();
        b.add_switch("core-switch", ep(50051)).unwrap();

        // "core-switch-eth1" is 16 characters
        match b.add_link("core-switch", "h1") {
            Err(TestbedError::InvalidLink { reason, .. }) => {
                assert!(reason.contains("core-switch-eth1"));
            }
            other => panic!("Expected InvalidLink, got {:?}", other),
        }
        assert!(b.add_link("h1", "aggregation-h2").is_err());
        assert!(b.node("h1").unwrap().interfaces.is_empty());

        // 15 characters is still fine
        b.add_host("edge-host3").unwrap();
        let link = b.add_link("edge-host3", "h1").unwrap();
        assert_eq!(link.a.name, "edge-host3-eth0");
    }

    #[tokio::test]
    async fn test_build_reports_orphans() {
        let mut b = TopologyBuilder::new();
        b.add_host("h1").unwrap();
        b.add_host("h2").unwrap();
        b.add_switch("s1", ep(50051)).unwrap();
        b.add_link("s1", "h1").unwrap();
        b.add_link("s1", "h2").unwrap();
        b.remove_node("h2").unwrap();

        let fabric = Arc::new(SimFabric::new());
        match b.build(fabric.clone()).await {
            Err(TestbedError::IncompleteTopology { orphans }) => {
                assert_eq!(orphans, vec!["s1-eth2 <-> h2-eth0".to_string()]);
            }
            other => panic!("Expected IncompleteTopology, got {:?}", other.map(|_| ())),
        }
        assert!(fabric.events().is_empty());
    }

    #[tokio::test]
    async fn test_build_rolls_back_on_link_failure() {
        let mut b = TopologyBuilder::new();
        b.add_host("h1").unwrap();
        b.add_host("h2").unwrap();
        b.add_switch("s1", ep(50051)).unwrap();
        b.add_link("s1", "h1").unwrap();
        b.add_link("s1", "h2").unwrap();

        let fabric = Arc::new(SimFabric::new().fail_links_touching("h2"));
        assert!(matches!(
            b.build(fabric.clone()).await,
            Err(TestbedError::Fabric { .. })
        ));
        assert!(fabric.live_nodes().is_empty());
        assert!(fabric.live_links().is_empty());
        assert!(fabric
            .events()
            .contains(&FabricEvent::LinkRemoved("h1-eth0 <-> s1-eth1".to_string())));
    }

    #[tokio::test]
    async fn test_build_creates_nodes_before_links() {
        let mut b = TopologyBuilder::new();
        b.add_host("h1").unwrap();
        b.add_switch("s1", ep(50051)).unwrap();
        b.add_link("s1", "h1").unwrap();

        let fabric = Arc::new(SimFabric::new());
        let topo = b.build(fabric.clone()).await.unwrap();
        assert_eq!(topo.links().len(), 1);
        assert_eq!(
            fabric.events(),
            vec![
                FabricEvent::NodeCreated("h1".to_string()),
                FabricEvent::NodeCreated("s1".to_string()),
                FabricEvent::LinkCreated("h1-eth0 <-> s1-eth1".to_string()),
            ]
        );
    }
}
