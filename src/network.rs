/**************************************************************************/
/*  This file is part of PGM2SSAT.                                        */
/*                                                                        */
/*  Copyright (C) 2025                                                    */
/*    CEA (Commissariat à l'énergie atomique et aux énergies              */
/*         alternatives)                                                  */
/*                                                                        */
/*  you can redistribute it and/or modify it under the terms of the GNU   */
/*  Lesser General Public License as published by the Free Software       */
/*  Foundation, version 2.1.                                              */
/*                                                                        */
/*  It is distributed in the hope that it will be useful,                 */
/*  but WITHOUT ANY WARRANTY; without even the implied warranty of        */
/*  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the         */
/*  GNU Lesser General Public License for more details.                   */
/*                                                                        */
/*  See the GNU Lesser General Public License version 2.1                 */
/*  for more details (enclosed in the file licenses/LGPLv2.1).            */
/*                                                                        */
/**************************************************************************/

//! Typed DAG of chance, decision and utility nodes.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]. Utility nodes list their
//! parents but are never registered as children: they are sinks kept in a separate list.

use anyhow::Context;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Index of a node in the network arena
pub type NodeId = usize;

/// Maximum deviation of the sum of a CPT row from 1
pub const ROW_SUM_TOLERANCE: f64 = 1e-6;

/// Decision threshold of SDP queries when none is given
pub const DEFAULT_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
/// What a node is, with the fields that only make sense for this kind.
pub enum NodeKind {
    /// A random variable with its conditional probability table
    Chance {
        /// state labels
        states: Vec<String>,
        /// one row per parent state combination, one column per state
        cpt: Vec<Vec<f64>>,
    },
    /// A variable whose value is chosen
    Decision {
        /// state labels
        states: Vec<String>,
    },
    /// A utility function of the parents
    Utility {
        /// one value per parent state combination
        values: Vec<f64>,
    },
}

/// Per node results of graph algorithms
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeMarks {
    /// post-order index in the last depth first topological sort
    pub finish: usize,
    /// number of decisions on a path to a utility
    pub decision_level: usize,
    /// needed to answer the query
    pub relevant: bool,
    /// ancestor of the SDP decision, but not otherwise relevant
    pub decision_only: bool,
    /// connected component label
    pub component: usize,
    /// in the connected component of the SDP decision
    pub cared: bool,
}

/// A node of the network.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// index in the arena
    pub id: NodeId,
    /// human readable name, unique in the network
    pub name: String,
    /// kind and tables
    pub kind: NodeKind,
    /// parents, in the order indexing the rows of the table
    pub parents: Vec<NodeId>,
    /// children, utility nodes excluded
    pub children: Vec<NodeId>,
    /// algorithm results
    pub marks: NodeMarks,
}

impl Node {
    /// State labels, empty for utility nodes
    pub fn states(&self) -> &[String] {
        match &self.kind {
            NodeKind::Chance { states, .. } | NodeKind::Decision { states } => states,
            NodeKind::Utility { .. } => &[],
        }
    }

    /// Number of states, 0 for utility nodes
    pub fn num_states(&self) -> usize {
        self.states().len()
    }

    /// true for chance nodes
    pub fn is_chance(&self) -> bool {
        matches!(self.kind, NodeKind::Chance { .. })
    }

    /// true for decision nodes
    pub fn is_decision(&self) -> bool {
        matches!(self.kind, NodeKind::Decision { .. })
    }

    /// true for utility nodes
    pub fn is_utility(&self) -> bool {
        matches!(self.kind, NodeKind::Utility { .. })
    }

    /// The conditional probability table of a chance node
    pub fn cpt(&self) -> Option<&[Vec<f64>]> {
        match &self.kind {
            NodeKind::Chance { cpt, .. } => Some(cpt),
            _ => None,
        }
    }

    /// The values of a utility node
    pub fn utility_values(&self) -> Option<&[f64]> {
        match &self.kind {
            NodeKind::Utility { values } => Some(values),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// What the network is
pub enum NetworkKind {
    /// Chance nodes only
    #[serde(rename = "BN", alias = "CPT")]
    Bayesian,
    /// Chance, decision and utility nodes
    #[serde(rename = "ID")]
    Influence,
}

impl NetworkKind {
    /// accepted names
    pub const VARIANTS: &'static [&'static str] = &["bn", "id"];
}

impl FromStr for NetworkKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bn" | "cpt" => Ok(NetworkKind::Bayesian),
            "id" => Ok(NetworkKind::Influence),
            _ => anyhow::bail!("unknown network kind {}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
/// The probabilistic quantity the compiled formula represents
pub enum QueryKind {
    /// probability of evidence
    Pe,
    /// most probable explanation
    Mpe,
    /// maximum a posteriori over some query variables
    Map,
    /// maximum expected utility of an influence diagram
    Meu,
    /// same decision probability
    Sdp,
}

impl QueryKind {
    /// accepted names
    pub const VARIANTS: &'static [&'static str] = &["pe", "mpe", "map", "meu", "sdp"];
}

impl Default for QueryKind {
    fn default() -> Self {
        QueryKind::Pe
    }
}

impl FromStr for QueryKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "pe" => QueryKind::Pe,
            "mpe" => QueryKind::Mpe,
            "map" => QueryKind::Map,
            "meu" => QueryKind::Meu,
            "sdp" => QueryKind::Sdp,
            _ => anyhow::bail!("unknown query {}", s),
        })
    }
}

impl std::fmt::Display for QueryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            QueryKind::Pe => "PE",
            QueryKind::Mpe => "MPE",
            QueryKind::Map => "MAP",
            QueryKind::Meu => "MEU",
            QueryKind::Sdp => "SDP",
        };
        write!(f, "{}", name)
    }
}

/// Fields of a same decision probability query
#[derive(Debug, Clone, PartialEq)]
pub struct SdpQuery {
    /// (node, state) pairs of the decision. Only one is supported by the encoder.
    pub decisions: Vec<(NodeId, usize)>,
    /// nodes which are not observed yet
    pub unobserved: Vec<NodeId>,
    /// decision threshold, in [0, 1]
    pub threshold: f64,
}

/// A Bayesian network or an influence diagram, with its query.
#[derive(Debug, Clone)]
pub struct Network {
    /// what the network is
    pub kind: NetworkKind,
    /// what is asked
    pub query: QueryKind,
    /// evidence is an intervention rather than an observation
    pub causal: bool,
    /// arena
    nodes: Vec<Node>,
    /// active chance and decision nodes
    order: Vec<NodeId>,
    /// active utility nodes
    utilities: Vec<NodeId>,
    names: BTreeMap<String, NodeId>,
    /// observed (node, state) pairs
    pub evidence: Vec<(NodeId, usize)>,
    /// query variables of MAP
    pub map_vars: Vec<NodeId>,
    /// SDP specific fields
    pub sdp: Option<SdpQuery>,
}

/// All the combinations of values of variables with these domain sizes, first variable most
/// significant. There is exactly one (empty) combination of zero variables.
/// # Example
/// ```
/// use pgm2ssat::network::combinations;
/// assert_eq!(combinations(&[]), vec![Vec::<usize>::new()]);
/// assert_eq!(combinations(&[2, 1]), vec![vec![0, 0], vec![1, 0]]);
/// ```
pub fn combinations(domains: &[usize]) -> Vec<Vec<usize>> {
    if domains.is_empty() {
        return vec![Vec::new()];
    }
    domains
        .iter()
        .map(|&n| 0..n)
        .multi_cartesian_product()
        .collect()
}

impl Network {
    /// An empty network
    pub fn new(kind: NetworkKind, query: QueryKind) -> Network {
        Network {
            kind,
            query,
            causal: false,
            nodes: Vec::new(),
            order: Vec::new(),
            utilities: Vec::new(),
            names: BTreeMap::new(),
            evidence: Vec::new(),
            map_vars: Vec::new(),
            sdp: None,
        }
    }

    /// Adds a node without edges.
    pub fn add_node(&mut self, name: &str, kind: NodeKind) -> anyhow::Result<NodeId> {
        let id = self.nodes.len();
        let name = if name.is_empty() {
            format!("n{}", id)
        } else {
            name.to_owned()
        };
        anyhow::ensure!(
            !self.names.contains_key(&name),
            "duplicate node name {}",
            name
        );
        self.names.insert(name.clone(), id);
        let node = Node {
            id,
            name,
            kind,
            parents: Vec::new(),
            children: Vec::new(),
            marks: NodeMarks::default(),
        };
        if node.is_utility() {
            self.utilities.push(id);
        } else {
            self.order.push(id);
        }
        self.nodes.push(node);
        Ok(id)
    }

    /// Adds an edge. The order in which the parents of a node are added is the order indexing
    /// the rows of its table.
    pub fn add_edge(&mut self, parent: NodeId, child: NodeId) -> anyhow::Result<()> {
        anyhow::ensure!(
            parent < self.nodes.len() && child < self.nodes.len(),
            "edge {} -> {} between unknown nodes",
            parent,
            child
        );
        anyhow::ensure!(parent != child, "self loop on {}", self.nodes[parent].name);
        anyhow::ensure!(
            !self.nodes[parent].is_utility(),
            "utility node {} cannot have children",
            self.nodes[parent].name
        );
        anyhow::ensure!(
            !self.nodes[child].parents.contains(&parent),
            "duplicate edge {} -> {}",
            self.nodes[parent].name,
            self.nodes[child].name
        );
        self.nodes[child].parents.push(parent);
        if !self.nodes[child].is_utility() {
            self.nodes[parent].children.push(child);
        }
        Ok(())
    }

    fn add_with_parents(
        &mut self,
        name: &str,
        kind: NodeKind,
        parents: &[NodeId],
    ) -> anyhow::Result<NodeId> {
        let id = self.add_node(name, kind)?;
        for &p in parents {
            self.add_edge(p, id)?;
        }
        Ok(id)
    }

    /// Adds a chance node and its incoming edges
    pub fn add_chance(
        &mut self,
        name: &str,
        states: &[&str],
        parents: &[NodeId],
        cpt: Vec<Vec<f64>>,
    ) -> anyhow::Result<NodeId> {
        let states = states.iter().map(|s| s.to_string()).collect();
        self.add_with_parents(name, NodeKind::Chance { states, cpt }, parents)
    }

    /// Adds a decision node and its incoming edges
    pub fn add_decision(
        &mut self,
        name: &str,
        states: &[&str],
        parents: &[NodeId],
    ) -> anyhow::Result<NodeId> {
        let states = states.iter().map(|s| s.to_string()).collect();
        self.add_with_parents(name, NodeKind::Decision { states }, parents)
    }

    /// Adds a utility node and its incoming edges
    pub fn add_utility(
        &mut self,
        name: &str,
        parents: &[NodeId],
        values: Vec<f64>,
    ) -> anyhow::Result<NodeId> {
        self.add_with_parents(name, NodeKind::Utility { values }, parents)
    }

    /// The node with this id. Panics on unknown ids.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Mutable access to a node. Panics on unknown ids.
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    /// All the nodes of the arena, including inactive ones
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Active chance and decision nodes, in the current order
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub(crate) fn set_order(&mut self, order: Vec<NodeId>) {
        self.order = order;
    }

    /// Active utility nodes
    pub fn utilities(&self) -> &[NodeId] {
        &self.utilities
    }

    pub(crate) fn set_utilities(&mut self, utilities: Vec<NodeId>) {
        self.utilities = utilities;
    }

    /// Looks up a node by name
    pub fn id_of(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    /// Number of states of a node
    pub fn num_states(&self, id: NodeId) -> usize {
        self.nodes[id].num_states()
    }

    /// Index of the state with this label
    pub fn state_index(&self, id: NodeId, label: &str) -> Option<usize> {
        self.nodes[id].states().iter().position(|s| s == label)
    }

    /// Records that `node` is observed in `state`
    pub fn add_evidence(&mut self, node: NodeId, state: usize) -> anyhow::Result<()> {
        anyhow::ensure!(node < self.nodes.len(), "evidence on unknown node {}", node);
        anyhow::ensure!(
            state < self.num_states(node),
            "evidence state {} out of range for {}",
            state,
            self.nodes[node].name
        );
        if let Some(&(_, previous)) = self.evidence.iter().find(|(n, _)| *n == node) {
            anyhow::ensure!(
                previous == state,
                "conflicting evidence on {}",
                self.nodes[node].name
            );
            return Ok(());
        }
        self.evidence.push((node, state));
        Ok(())
    }

    /// Records evidence by node name and state label
    pub fn add_evidence_by_name(&mut self, node: &str, state: &str) -> anyhow::Result<()> {
        let (id, index) = self.resolve(node, state)?;
        self.add_evidence(id, index)
    }

    fn resolve(&self, node: &str, state: &str) -> anyhow::Result<(NodeId, usize)> {
        let id = self
            .id_of(node)
            .with_context(|| format!("unknown node {}", node))?;
        let index = self
            .state_index(id, state)
            .with_context(|| format!("node {} has no state {}", node, state))?;
        Ok((id, index))
    }

    /// The state of `node` in the evidence, if any
    pub fn evidence_state(&self, node: NodeId) -> Option<usize> {
        self.evidence
            .iter()
            .find(|(n, _)| *n == node)
            .map(|&(_, s)| s)
    }

    /// The parent state combinations indexing the table of `id`
    pub fn parent_combinations(&self, id: NodeId) -> Vec<Vec<usize>> {
        let domains: Vec<usize> = self.nodes[id]
            .parents
            .iter()
            .map(|&p| self.num_states(p))
            .collect();
        combinations(&domains)
    }

    /// The arena as a petgraph graph, node weights are ids.
    pub fn to_digraph(&self) -> petgraph::Graph<NodeId, ()> {
        let mut graph = petgraph::Graph::with_capacity(self.nodes.len(), 0);
        let indices: Vec<_> = self.nodes.iter().map(|n| graph.add_node(n.id)).collect();
        for node in &self.nodes {
            for &p in &node.parents {
                graph.add_edge(indices[p], indices[node.id], ());
            }
        }
        graph
    }

    /// Checks the invariants of the network: table dimensions, kinds, acyclicity, and that
    /// query fields reference existing nodes.
    pub fn validate(&self) -> anyhow::Result<()> {
        for node in &self.nodes {
            let rows: usize = node.parents.iter().map(|&p| self.num_states(p)).product();
            match &node.kind {
                NodeKind::Chance { states, cpt } => {
                    anyhow::ensure!(!states.is_empty(), "chance node {} has no state", node.name);
                    anyhow::ensure!(
                        cpt.len() == rows,
                        "cpt of {} has {} rows, expected {}",
                        node.name,
                        cpt.len(),
                        rows
                    );
                    for (i, row) in cpt.iter().enumerate() {
                        anyhow::ensure!(
                            row.len() == states.len(),
                            "row {} of the cpt of {} has {} entries, expected {}",
                            i,
                            node.name,
                            row.len(),
                            states.len()
                        );
                        anyhow::ensure!(
                            row.iter().all(|&p| (0.0..=1.0 + ROW_SUM_TOLERANCE).contains(&p)),
                            "row {} of the cpt of {} has a value outside [0, 1]",
                            i,
                            node.name
                        );
                        let sum: f64 = row.iter().sum();
                        anyhow::ensure!(
                            (sum - 1.0).abs() <= ROW_SUM_TOLERANCE,
                            "row {} of the cpt of {} sums to {}",
                            i,
                            node.name,
                            sum
                        );
                    }
                }
                NodeKind::Decision { states } => {
                    anyhow::ensure!(
                        self.kind == NetworkKind::Influence,
                        "decision node {} in a bayesian network",
                        node.name
                    );
                    anyhow::ensure!(!states.is_empty(), "decision node {} has no state", node.name);
                }
                NodeKind::Utility { values } => {
                    anyhow::ensure!(
                        self.kind == NetworkKind::Influence,
                        "utility node {} in a bayesian network",
                        node.name
                    );
                    anyhow::ensure!(
                        values.len() == rows,
                        "utility {} has {} values, expected {}",
                        node.name,
                        values.len(),
                        rows
                    );
                }
            }
        }
        let graph = self.to_digraph();
        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            anyhow::bail!(
                "network is not acyclic, cycle through {}",
                self.nodes[graph[cycle.node_id()]].name
            );
        }
        let exists = |id: NodeId, what: &str| -> anyhow::Result<()> {
            anyhow::ensure!(id < self.nodes.len(), "{} references unknown node {}", what, id);
            anyhow::ensure!(
                !self.nodes[id].is_utility(),
                "{} references utility node {}",
                what,
                self.nodes[id].name
            );
            Ok(())
        };
        for &(id, state) in &self.evidence {
            exists(id, "evidence")?;
            anyhow::ensure!(
                state < self.num_states(id),
                "evidence state {} out of range for {}",
                state,
                self.nodes[id].name
            );
        }
        for &id in &self.map_vars {
            exists(id, "MAP query")?;
        }
        if let Some(sdp) = &self.sdp {
            for &(id, state) in &sdp.decisions {
                exists(id, "SDP decision")?;
                anyhow::ensure!(
                    state < self.num_states(id),
                    "SDP decision state {} out of range for {}",
                    state,
                    self.nodes[id].name
                );
            }
            for &id in &sdp.unobserved {
                exists(id, "SDP unobserved list")?;
            }
            anyhow::ensure!(
                (0.0..=1.0).contains(&sdp.threshold),
                "SDP threshold {} outside [0, 1]",
                sdp.threshold
            );
        }
        Ok(())
    }

    /// Compacts the arena to the active nodes: chance and decision nodes get ids 0..N in the
    /// current order, utilities follow. Query fields are remapped, references to removed nodes
    /// are dropped. Returns the old id to new id mapping.
    pub fn relabel(&mut self) -> anyhow::Result<Vec<Option<NodeId>>> {
        let kept: Vec<NodeId> = self
            .order
            .iter()
            .chain(self.utilities.iter())
            .copied()
            .collect();
        let mut mapping = vec![None; self.nodes.len()];
        for (new, &old) in kept.iter().enumerate() {
            mapping[old] = Some(new);
        }
        let mut nodes = Vec::with_capacity(kept.len());
        for &old in &kept {
            let mut node = self.nodes[old].clone();
            for &p in &node.parents {
                anyhow::ensure!(
                    mapping[p].is_some(),
                    "node {} is kept without its parent {}",
                    node.name,
                    self.nodes[p].name
                );
            }
            node.id = nodes.len();
            node.parents = node.parents.iter().filter_map(|&p| mapping[p]).collect();
            node.children = node.children.iter().filter_map(|&c| mapping[c]).collect();
            nodes.push(node);
        }
        let active = self.order.len();
        self.order = (0..active).collect();
        self.utilities = (active..nodes.len()).collect();
        self.names = nodes.iter().map(|n| (n.name.clone(), n.id)).collect();
        self.nodes = nodes;
        let remap_pairs = |pairs: &[(NodeId, usize)]| -> Vec<(NodeId, usize)> {
            pairs
                .iter()
                .filter_map(|&(id, s)| mapping[id].map(|new| (new, s)))
                .collect()
        };
        self.evidence = remap_pairs(&self.evidence);
        self.map_vars = self.map_vars.iter().filter_map(|&id| mapping[id]).collect();
        if let Some(sdp) = self.sdp.as_mut() {
            sdp.decisions = remap_pairs(&sdp.decisions);
            sdp.unobserved = sdp.unobserved.iter().filter_map(|&id| mapping[id]).collect();
        }
        Ok(mapping)
    }

    /// Turns evidence into interventions: every evidence node loses its incoming edges and its
    /// table becomes a point mass on the observed state.
    pub fn mutilate(&mut self) -> anyhow::Result<()> {
        for (id, state) in self.evidence.clone() {
            let name = self.nodes[id].name.clone();
            match &mut self.nodes[id].kind {
                NodeKind::Chance { states, cpt } => {
                    let mut row = vec![0.; states.len()];
                    row[state] = 1.;
                    *cpt = vec![row];
                }
                _ => anyhow::bail!("cannot intervene on non chance node {}", name),
            }
            let parents = std::mem::take(&mut self.nodes[id].parents);
            for p in parents {
                self.nodes[p].children.retain(|&c| c != id);
            }
            tracing::trace!(node = %name, "mutilated");
        }
        Ok(())
    }

    /// Builds a network from its JSON-friendly description, and validates it.
    pub fn from_description(description: &NetworkDescription) -> anyhow::Result<Network> {
        let mut network = Network::new(description.kind, description.query);
        network.causal = description.causal;
        for node in &description.nodes {
            network
                .add_node(&node.name, node.kind.clone())
                .with_context(|| format!("adding node {}", node.name))?;
        }
        for node in &description.nodes {
            let child = network
                .id_of(&node.name)
                .with_context(|| format!("unknown node {}", node.name))?;
            for parent in &node.parents {
                let parent = network
                    .id_of(parent)
                    .with_context(|| format!("unknown parent {} of {}", parent, node.name))?;
                network.add_edge(parent, child)?;
            }
        }
        for e in &description.evidence {
            network
                .add_evidence_by_name(&e.node, &e.state)
                .context("reading evidence")?;
        }
        for name in &description.map {
            let id = network
                .id_of(name)
                .with_context(|| format!("unknown MAP query variable {}", name))?;
            network.map_vars.push(id);
        }
        if let Some(sdp) = &description.sdp {
            let decisions = sdp
                .decisions
                .iter()
                .map(|d| network.resolve(&d.node, &d.state))
                .collect::<anyhow::Result<Vec<_>>>()
                .context("reading SDP decision")?;
            let unobserved = sdp
                .unobserved
                .iter()
                .map(|name| {
                    network
                        .id_of(name)
                        .with_context(|| format!("unknown unobserved node {}", name))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            network.sdp = Some(SdpQuery {
                decisions,
                unobserved,
                threshold: sdp.threshold,
            });
        }
        network.validate()?;
        Ok(network)
    }
}

/// A node of [`NetworkDescription`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    /// unique name
    pub name: String,
    /// names of the parents, in table order
    #[serde(default)]
    pub parents: Vec<String>,
    /// kind and table
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// A (node, state) pair by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRef {
    /// node name
    pub node: String,
    /// state label
    pub state: String,
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

/// SDP fields of [`NetworkDescription`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdpDescription {
    /// the decision
    pub decisions: Vec<StateRef>,
    /// names of unobserved nodes
    #[serde(default)]
    pub unobserved: Vec<String>,
    /// decision threshold
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

/// Serializable description of a network, referring to nodes and states by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDescription {
    /// kind of network
    pub kind: NetworkKind,
    /// query
    #[serde(default)]
    pub query: QueryKind,
    /// interventional evidence
    #[serde(default)]
    pub causal: bool,
    /// all nodes, utilities included
    pub nodes: Vec<NodeDescription>,
    /// observed states
    #[serde(default)]
    pub evidence: Vec<StateRef>,
    /// MAP query variables
    #[serde(default)]
    pub map: Vec<String>,
    /// SDP fields
    #[serde(default)]
    pub sdp: Option<SdpDescription>,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::two_nodes;

    #[test]
    fn valid() -> anyhow::Result<()> {
        two_nodes().validate()
    }

    #[test]
    fn bad_dimensions() {
        let mut net = two_nodes();
        net.add_chance("D", &["a", "b"], &[0, 1], vec![vec![0.5, 0.5]; 3])
            .unwrap();
        assert!(net.validate().is_err());
    }

    #[test]
    fn bad_row_sum() {
        let mut net = Network::new(NetworkKind::Bayesian, QueryKind::Pe);
        net.add_chance("A", &["0", "1"], &[], vec![vec![0.5, 0.6]])
            .unwrap();
        assert!(net.validate().is_err());
    }

    #[test]
    fn cycle() {
        let mut net = Network::new(NetworkKind::Bayesian, QueryKind::Pe);
        let a = net
            .add_chance("A", &["0", "1"], &[], vec![vec![0.5, 0.5]; 2])
            .unwrap();
        let b = net
            .add_chance("B", &["0", "1"], &[a], vec![vec![0.5, 0.5]; 2])
            .unwrap();
        net.add_edge(b, a).unwrap();
        let err = net.validate().unwrap_err();
        assert!(format!("{}", err).contains("acyclic"));
    }

    #[test]
    fn decision_in_bn() {
        let mut net = two_nodes();
        net.add_decision("D", &["a", "b"], &[]).unwrap();
        assert!(net.validate().is_err());
    }

    #[test]
    fn duplicate_name() {
        let mut net = two_nodes();
        assert!(net
            .add_chance("R", &["0"], &[], vec![vec![1.0]])
            .is_err());
    }

    #[test]
    fn utility_is_not_a_child() -> anyhow::Result<()> {
        let mut net = Network::new(NetworkKind::Influence, QueryKind::Meu);
        let d = net.add_decision("D", &["a", "b"], &[])?;
        let u = net.add_utility("U", &[d], vec![1.0, 2.0])?;
        assert!(net.node(d).children.is_empty());
        assert_eq!(net.node(u).parents, vec![d]);
        assert_eq!(net.utilities(), &[u]);
        assert_eq!(net.order(), &[d]);
        net.validate()
    }

    #[test]
    fn parent_combinations_order() -> anyhow::Result<()> {
        let mut net = Network::new(NetworkKind::Bayesian, QueryKind::Pe);
        let a = net.add_chance("A", &["0", "1"], &[], vec![vec![0.5, 0.5]])?;
        let b = net.add_chance("B", &["0", "1", "2"], &[], vec![vec![0.2, 0.3, 0.5]])?;
        let c = net.add_chance("C", &["0", "1"], &[a, b], vec![vec![0.5, 0.5]; 6])?;
        assert_eq!(
            net.parent_combinations(c),
            vec![
                vec![0, 0],
                vec![0, 1],
                vec![0, 2],
                vec![1, 0],
                vec![1, 1],
                vec![1, 2]
            ]
        );
        assert_eq!(net.parent_combinations(a), vec![Vec::<usize>::new()]);
        Ok(())
    }

    #[test]
    fn relabel_drops_removed() -> anyhow::Result<()> {
        let mut net = Network::new(NetworkKind::Bayesian, QueryKind::Pe);
        let a = net.add_chance("A", &["0", "1"], &[], vec![vec![0.5, 0.5]])?;
        let b = net.add_chance("B", &["0", "1"], &[], vec![vec![0.5, 0.5]])?;
        let c = net.add_chance("C", &["0", "1"], &[b], vec![vec![0.5, 0.5]; 2])?;
        net.add_evidence(a, 1)?;
        net.add_evidence(c, 0)?;
        net.map_vars = vec![a, b];
        net.set_order(vec![b, c]);
        let mapping = net.relabel()?;
        assert_eq!(mapping, vec![None, Some(0), Some(1)]);
        assert_eq!(net.nodes().len(), 2);
        assert_eq!(net.evidence, vec![(1, 0)]);
        assert_eq!(net.map_vars, vec![0]);
        assert_eq!(net.node(1).parents, vec![0]);
        assert_eq!(net.node(0).children, vec![1]);
        assert_eq!(net.id_of("C"), Some(1));
        assert_eq!(net.id_of("A"), None);
        net.validate()
    }

    #[test]
    fn relabel_refuses_orphans() -> anyhow::Result<()> {
        let mut net = two_nodes();
        net.set_order(vec![1]);
        assert!(net.relabel().is_err());
        Ok(())
    }

    #[test]
    fn mutilation() -> anyhow::Result<()> {
        let mut net = two_nodes();
        net.add_evidence(1, 1)?;
        net.mutilate()?;
        assert!(net.node(1).parents.is_empty());
        assert!(net.node(0).children.is_empty());
        assert_eq!(net.node(1).cpt(), Some(&[vec![0.0, 1.0]][..]));
        net.validate()
    }

    #[test]
    fn json_description() -> anyhow::Result<()> {
        let text = r#"{
            "kind": "BN",
            "query": "PE",
            "nodes": [
                { "name": "R", "kind": "chance", "states": ["0", "1"], "cpt": [[0.5, 0.5]] },
                { "name": "C", "kind": "chance", "states": ["0", "1"], "parents": ["R"],
                  "cpt": [[0.8, 0.2], [0.2, 0.8]] }
            ],
            "evidence": [ { "node": "C", "state": "1" } ]
        }"#;
        let description: NetworkDescription = serde_json::from_str(text)?;
        let net = Network::from_description(&description)?;
        assert_eq!(net.nodes(), two_nodes().nodes());
        assert_eq!(net.evidence, vec![(1, 1)]);
        Ok(())
    }

    #[test]
    fn json_unknown_parent() -> anyhow::Result<()> {
        let text = r#"{
            "kind": "BN",
            "nodes": [
                { "name": "C", "kind": "chance", "states": ["0"], "parents": ["R"], "cpt": [[1.0]] }
            ]
        }"#;
        let description: NetworkDescription = serde_json::from_str(text)?;
        assert!(Network::from_description(&description).is_err());
        Ok(())
    }
}
