//! Network testbed orchestrator for programmable-switch benchmarks.
//!
//! Builds an emulated topology of hosts and programmable switches and starts
//! a forwarding agent per switch, bound to its data-plane endpoint and to an
//! external controller.
//!
//! # Lifecycle
//!
//! | Phase | Component | Effect |
//! |-------|-----------|--------|
//! | describe | [`TopologyBuilder`] | names, interfaces, links (no side effects) |
//! | build | [`LinkFabric`] | namespaces and veth pairs |
//! | start | [`ControllerBinding`] | `bind_data_plane` → `attach_controller` → `start` |
//! | tune | [`InterfaceTuner`] | `gro`/`rx`/`tx` offloads off on host interfaces |
//! | stop | [`Orchestrator::stop`] | agents stopped, fabric released, [`TeardownReport`] |
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use netbench::{Endpoint, EthtoolTuner, NetnsFabric, Orchestrator, ProcessAgent, TopologyBuilder};
//!
//! let mut topo = TopologyBuilder::new();
//! topo.add_host("h1")?;
//! topo.add_host("h2")?;
//! topo.add_switch("s1", "127.0.0.1:50051".parse()?)?;
//! topo.add_link("s1", "h1")?;
//! topo.add_link("s1", "h2")?;
//!
//! let orch = Orchestrator::new(
//!     Arc::new(NetnsFabric::new()),
//!     Arc::new(ProcessAgent::new(Default::default())),
//!     Arc::new(EthtoolTuner::new()),
//! );
//! let running = orch.build_and_start(topo, Endpoint::new("127.0.0.1", 6653)).await?;
//! let report = orch.stop(running).await;
//! ```

pub mod agent;
pub mod binding;
pub mod builder;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod fabric;
pub mod node;
pub mod orchestrator;
pub mod sim;
pub mod topology;
pub mod tuning;

pub use agent::{AgentCommand, AgentLaunch, ForwardingAgent, ProcessAgent};
pub use binding::{BindingState, ControllerBinding, PortRegistry};
pub use builder::TopologyBuilder;
pub use config::TestbedConfig;
pub use endpoint::Endpoint;
pub use error::{TestbedError, TestbedResult};
pub use fabric::{LinkFabric, NetnsFabric};
pub use node::{Interface, Link, Node, NodeKind, SwitchSpec};
pub use orchestrator::{Orchestrator, RunningTopology, TeardownReport};
pub use topology::{NodeTeardownError, Topology};
pub use tuning::{EthtoolTuner, InterfaceTuner};
