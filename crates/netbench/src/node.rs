//! Nodes, interfaces and links.
//!
//! A node is either a host (traffic endpoint, own network namespace) or a
//! switch (forwarding element under test, root namespace). Interfaces are
//! named `<node>-eth<ordinal>`; host ordinals start at 0 and switch ordinals
//! start at 1 so that a switch interface ordinal doubles as the forwarding
//! agent's port number.

use std::fmt;

use serde::Serialize;

use crate::endpoint::Endpoint;

/// Switch-specific node data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwitchSpec {
    /// Local data-plane configuration endpoint served by the forwarding agent.
    pub data_plane: Endpoint,
    /// Device id announced on the data-plane channel.
    pub device_id: u64,
    /// Controller for this switch, overriding the topology-wide one.
    pub controller: Option<Endpoint>,
}

/// The kind of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NodeKind {
    /// A traffic endpoint.
    Host,
    /// A programmable switch.
    Switch(SwitchSpec),
}

impl NodeKind {
    /// First interface ordinal for this kind of node.
    pub fn first_ordinal(&self) -> u32 {
        match self {
            NodeKind::Host => 0,
            NodeKind::Switch(_) => 1,
        }
    }

    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Host => "host",
            NodeKind::Switch(_) => "switch",
        }
    }
}

/// A virtual interface owned by exactly one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Interface {
    /// Owning node name.
    pub node: String,
    /// Ordinal within the owning node.
    pub ordinal: u32,
    /// Derived interface name, e.g. `s1-eth1`.
    pub name: String,
}

impl Interface {
    /// Creates the interface `ordinal` of `node`.
    pub fn new(node: &str, ordinal: u32) -> Self {
        Self {
            node: node.to_string(),
            ordinal,
            name: interface_name(node, ordinal),
        }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Longest interface name the kernel accepts (`IFNAMSIZ` minus the NUL).
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Derives the interface name for (node, ordinal).
pub fn interface_name(node: &str, ordinal: u32) -> String {
    format!("{}-eth{}", node, ordinal)
}

/// A point-to-point link between two interfaces on different nodes.
///
/// Links are unordered: `a`/`b` only record the order of `add_link`.
#[derive(Debug, Clone, Eq, Serialize)]
pub struct Link {
    /// First endpoint interface.
    pub a: Interface,
    /// Second endpoint interface.
    pub b: Interface,
}

impl Link {
    /// Creates a link between two interfaces.
    pub fn new(a: Interface, b: Interface) -> Self {
        Self { a, b }
    }

    /// Returns true if either side belongs to `node`.
    pub fn touches(&self, node: &str) -> bool {
        self.a.node == node || self.b.node == node
    }

    /// Returns the interface of this link that belongs to `node`.
    pub fn side_of(&self, node: &str) -> Option<&Interface> {
        if self.a.node == node {
            Some(&self.a)
        } else if self.b.node == node {
            Some(&self.b)
        } else {
            None
        }
    }

    /// Both endpoint interfaces.
    pub fn ends(&self) -> [&Interface; 2] {
        [&self.a, &self.b]
    }
}

impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        (self.a == other.a && self.b == other.b) || (self.a == other.b && self.b == other.a)
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.a, self.b)
    }
}

/// A host or switch with its interfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    /// Unique node name.
    pub name: String,
    /// Host or switch.
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Interfaces in allocation order.
    pub interfaces: Vec<Interface>,
}

impl Node {
    /// Creates a host node without interfaces.
    pub fn host(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Host,
            interfaces: Vec::new(),
        }
    }

    /// Creates a switch node without interfaces.
    pub fn switch(name: impl Into<String>, spec: SwitchSpec) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Switch(spec),
            interfaces: Vec::new(),
        }
    }

    /// Returns true for hosts.
    pub fn is_host(&self) -> bool {
        matches!(self.kind, NodeKind::Host)
    }

    /// Returns the switch data, if this is a switch.
    pub fn switch_spec(&self) -> Option<&SwitchSpec> {
        match &self.kind {
            NodeKind::Switch(spec) => Some(spec),
            NodeKind::Host => None,
        }
    }

    fn next_ordinal(&self) -> u32 {
        self.kind.first_ordinal() + self.interfaces.len() as u32
    }

    /// Name the next allocated interface will get.
    pub fn next_interface_name(&self) -> String {
        interface_name(&self.name, self.next_ordinal())
    }

    /// Allocates the next interface on this node.
    pub fn allocate_interface(&mut self) -> Interface {
        let iface = Interface::new(&self.name, self.next_ordinal());
        self.interfaces.push(iface.clone());
        iface
    }

    /// Returns true if this node owns `iface`.
    pub fn owns(&self, iface: &Interface) -> bool {
        iface.node == self.name && self.interfaces.contains(iface)
    }

    /// Network namespace the node lives in (`None` = root namespace).
    pub fn namespace(&self) -> Option<&str> {
        match self.kind {
            NodeKind::Host => Some(&self.name),
            NodeKind::Switch(_) => None,
        }
    }
}
