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

//! Graph algorithms on [`Network`]: orderings, relevance pruning, connected components and
//! elimination orders.
//!
//! All traversals are iterative and only follow edges between active nodes.

use crate::network::{Network, NetworkKind, NodeId, QueryKind};
use fixedbitset::FixedBitSet;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

/// How to compute a topological order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopoSortMethod {
    /// depth first search from parentless nodes, by decreasing finish index
    Dfs,
    /// depth first search along parent edges from childless nodes, by increasing finish index
    ReverseDfs,
    /// repeatedly remove the lowest id node with no remaining parent
    Removal,
}

impl TopoSortMethod {
    /// accepted names
    pub const VARIANTS: &'static [&'static str] = &["dfs", "reverse-dfs", "removal"];
}

impl FromStr for TopoSortMethod {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "dfs" => TopoSortMethod::Dfs,
            "reverse-dfs" => TopoSortMethod::ReverseDfs,
            "removal" => TopoSortMethod::Removal,
            _ => anyhow::bail!("unknown topological sort method {}", s),
        })
    }
}

/// Decisions grouped by decision level
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecisionLevels {
    /// highest level, 0 when there is no decision
    pub max: usize,
    /// decisions of each level, in topological order
    pub levels: BTreeMap<usize, Vec<NodeId>>,
}

impl DecisionLevels {
    /// Decisions at this level
    pub fn at(&self, level: usize) -> &[NodeId] {
        self.levels.get(&level).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

impl Network {
    /// The set of active nodes
    pub fn active_set(&self) -> FixedBitSet {
        let mut res = FixedBitSet::with_capacity(self.nodes().len());
        for &id in self.order() {
            res.insert(id);
        }
        res
    }

    fn dfs_finish_order(&self, reverse: bool) -> anyhow::Result<Vec<NodeId>> {
        let n = self.nodes().len();
        let active = self.active_set();
        let mut visited = FixedBitSet::with_capacity(n);
        let mut on_stack = FixedBitSet::with_capacity(n);
        let mut finished = Vec::with_capacity(self.order().len());
        for &root in self.order() {
            let node = self.node(root);
            let incoming = if reverse { &node.children } else { &node.parents };
            if visited[root] || incoming.iter().any(|&x| active[x]) {
                continue;
            }
            visited.insert(root);
            on_stack.insert(root);
            let mut stack = vec![(root, 0)];
            while let Some(top) = stack.last_mut() {
                let (id, index) = *top;
                let node = self.node(id);
                let outgoing = if reverse { &node.parents } else { &node.children };
                if index < outgoing.len() {
                    top.1 += 1;
                    let next = outgoing[index];
                    if !active[next] {
                        continue;
                    }
                    anyhow::ensure!(
                        !on_stack[next],
                        "network is not acyclic, cycle through {}",
                        self.node(next).name
                    );
                    if !visited[next] {
                        visited.insert(next);
                        on_stack.insert(next);
                        stack.push((next, 0));
                    }
                } else {
                    on_stack.set(id, false);
                    finished.push(id);
                    stack.pop();
                }
            }
        }
        anyhow::ensure!(
            finished.len() == self.order().len(),
            "network is not acyclic"
        );
        Ok(finished)
    }

    fn removal_order(&self) -> anyhow::Result<Vec<NodeId>> {
        let active = self.active_set();
        let mut remaining: BTreeMap<NodeId, usize> = self
            .order()
            .iter()
            .map(|&id| {
                let count = self.node(id).parents.iter().filter(|&&p| active[p]).count();
                (id, count)
            })
            .collect();
        let mut ready: BTreeSet<NodeId> = remaining
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut result = Vec::with_capacity(remaining.len());
        while let Some(id) = ready.iter().next().copied() {
            ready.remove(&id);
            result.push(id);
            for &child in &self.node(id).children {
                if let Some(count) = remaining.get_mut(&child) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(child);
                    }
                }
            }
        }
        anyhow::ensure!(
            result.len() == self.order().len(),
            "network is not acyclic"
        );
        Ok(result)
    }

    /// Computes a topological order of the active nodes. Depth first methods record the
    /// finish index of every node in its marks.
    pub fn topological_order(&mut self, method: TopoSortMethod) -> anyhow::Result<Vec<NodeId>> {
        match method {
            TopoSortMethod::Dfs | TopoSortMethod::ReverseDfs => {
                let reverse = method == TopoSortMethod::ReverseDfs;
                let mut finished = self.dfs_finish_order(reverse)?;
                for (i, &id) in finished.iter().enumerate() {
                    self.node_mut(id).marks.finish = i;
                }
                if !reverse {
                    finished.reverse();
                }
                Ok(finished)
            }
            TopoSortMethod::Removal => self.removal_order(),
        }
    }

    /// Reorders the active nodes topologically
    pub fn topological_sort(&mut self, method: TopoSortMethod) -> anyhow::Result<()> {
        let order = self.topological_order(method)?;
        self.set_order(order);
        Ok(())
    }

    /// The nodes from which one of `roots` can be reached, roots included.
    pub fn ancestors(&self, roots: &[NodeId]) -> FixedBitSet {
        let mut res = FixedBitSet::with_capacity(self.nodes().len());
        let mut stack = Vec::new();
        for &root in roots {
            if !res.put(root) {
                stack.push(root);
            }
        }
        while let Some(id) = stack.pop() {
            for &p in &self.node(id).parents {
                if !res.put(p) {
                    stack.push(p);
                }
            }
        }
        res
    }

    /// Sets the relevant mark of active nodes and returns how many are relevant.
    ///
    /// For a bayesian network, relevant nodes are the ancestors of the evidence, MAP query
    /// variables, SDP unobserved nodes and, when `include_decision`, of the SDP decision.
    /// For an influence diagram, they are the ancestors of the parents of utility nodes.
    pub fn mark_relevant(&mut self, include_decision: bool) -> usize {
        let roots: Vec<NodeId> = match self.kind {
            NetworkKind::Bayesian => {
                let mut roots: Vec<NodeId> = self.evidence.iter().map(|&(id, _)| id).collect();
                roots.extend(self.map_vars.iter().copied());
                if let Some(sdp) = &self.sdp {
                    roots.extend(sdp.unobserved.iter().copied());
                    if include_decision {
                        roots.extend(sdp.decisions.iter().map(|&(id, _)| id));
                    }
                }
                roots
            }
            NetworkKind::Influence => self
                .utilities()
                .iter()
                .flat_map(|&u| self.node(u).parents.iter().copied())
                .collect(),
        };
        let relevant = self.ancestors(&roots);
        let mut count = 0;
        for id in self.order().to_vec() {
            self.node_mut(id).marks.relevant = relevant[id];
            count += relevant[id] as usize;
        }
        count
    }

    /// Drops the irrelevant nodes from the active list and returns how many were dropped.
    ///
    /// For SDP queries, relevance is computed first without the decision: nodes that only
    /// become relevant with it are flagged `decision_only`.
    pub fn prune(&mut self) -> usize {
        let before = self.order().len();
        self.mark_relevant(false);
        if self.query == QueryKind::Sdp {
            let without: Vec<(NodeId, bool)> = self
                .order()
                .iter()
                .map(|&id| (id, self.node(id).marks.relevant))
                .collect();
            self.mark_relevant(true);
            for (id, was_relevant) in without {
                let marks = &mut self.node_mut(id).marks;
                marks.decision_only = marks.relevant && !was_relevant;
            }
        }
        let order: Vec<NodeId> = self
            .order()
            .iter()
            .copied()
            .filter(|&id| self.node(id).marks.relevant)
            .collect();
        self.set_order(order);
        let removed = before - self.order().len();
        tracing::debug!(removed, remaining = self.order().len(), "pruned network");
        removed
    }

    /// Labels the active nodes by connected component of the undirected graph, returns the
    /// number of components.
    pub fn connected_components(&mut self) -> usize {
        let active = self.active_set();
        let mut labeled = FixedBitSet::with_capacity(self.nodes().len());
        let mut label = 0;
        for root in self.order().to_vec() {
            if labeled.put(root) {
                continue;
            }
            let mut stack = vec![root];
            while let Some(id) = stack.pop() {
                self.node_mut(id).marks.component = label;
                let node = self.node(id);
                let neighbors: Vec<NodeId> = node
                    .parents
                    .iter()
                    .chain(node.children.iter())
                    .copied()
                    .filter(|&x| active[x])
                    .collect();
                for x in neighbors {
                    if !labeled.put(x) {
                        stack.push(x);
                    }
                }
            }
            label += 1;
        }
        label
    }

    /// Keeps only the active nodes in the connected component of `of`, and marks them cared.
    /// Returns the number of dropped nodes.
    pub fn isolate_component(&mut self, of: NodeId) -> usize {
        let count = self.connected_components();
        let label = self.node(of).marks.component;
        let before = self.order().len();
        for id in self.order().to_vec() {
            let marks = &mut self.node_mut(id).marks;
            marks.cared = marks.component == label;
        }
        let order: Vec<NodeId> = self
            .order()
            .iter()
            .copied()
            .filter(|&id| self.node(id).marks.cared)
            .collect();
        self.set_order(order);
        tracing::debug!(components = count, kept = self.order().len(), "isolated component");
        before - self.order().len()
    }

    /// Min-fill elimination order of the active nodes on the undirected interaction graph.
    ///
    /// The fill cost of a node is the sum over pairs of non adjacent neighbors of the
    /// product of their domain sizes. Ties are broken by lowest id.
    pub fn minfill_order(&self) -> Vec<NodeId> {
        let active = self.active_set();
        let mut graph: BTreeMap<NodeId, BTreeSet<NodeId>> = self
            .order()
            .iter()
            .map(|&id| {
                let node = self.node(id);
                let neighbors = node
                    .parents
                    .iter()
                    .chain(node.children.iter())
                    .copied()
                    .filter(|&x| active[x])
                    .collect();
                (id, neighbors)
            })
            .collect();
        let domain = |id: NodeId| self.num_states(id) as u64;
        let fill_cost = |graph: &BTreeMap<NodeId, BTreeSet<NodeId>>, id: NodeId| -> u64 {
            let neighbors: Vec<NodeId> = graph[&id].iter().copied().collect();
            let mut cost = 0u64;
            for (i, &a) in neighbors.iter().enumerate() {
                for &b in &neighbors[i + 1..] {
                    if !graph[&a].contains(&b) {
                        cost = cost.saturating_add(domain(a).saturating_mul(domain(b)));
                    }
                }
            }
            cost
        };
        let mut result = Vec::with_capacity(graph.len());
        loop {
            let mut best: Option<(u64, NodeId)> = None;
            for &id in graph.keys() {
                let cost = fill_cost(&graph, id);
                if best.map_or(true, |(c, _)| cost < c) {
                    best = Some((cost, id));
                }
            }
            let id = match best {
                Some((_, id)) => id,
                None => break,
            };
            let neighbors = graph.remove(&id).unwrap_or_default();
            for &a in &neighbors {
                if let Some(set) = graph.get_mut(&a) {
                    set.remove(&id);
                    set.extend(neighbors.iter().copied().filter(|&b| b != a));
                }
            }
            result.push(id);
        }
        result
    }

    /// Computes decision levels. The active order must be topological.
    ///
    /// A node's level is the maximum level of its children (only chance children for a
    /// decision), plus one for a decision.
    pub fn assign_decision_levels(&mut self) -> DecisionLevels {
        let active = self.active_set();
        let mut res = DecisionLevels::default();
        for id in self.order().iter().rev().copied().collect::<Vec<_>>() {
            let node = self.node(id);
            let decision = node.is_decision();
            let mut level = node
                .children
                .iter()
                .filter(|&&c| active[c] && (!decision || self.node(c).is_chance()))
                .map(|&c| self.node(c).marks.decision_level)
                .max()
                .unwrap_or(0);
            if decision {
                level += 1;
                res.levels.entry(level).or_insert_with(Vec::new).push(id);
                res.max = res.max.max(level);
            }
            self.node_mut(id).marks.decision_level = level;
        }
        for nodes in res.levels.values_mut() {
            nodes.reverse();
        }
        res
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{random_bn, two_nodes, umbrella};
    use rand::SeedableRng;

    fn check_topological(net: &Network, order: &[NodeId]) {
        let mut sorted = order.to_vec();
        sorted.sort_unstable();
        let mut expected = net.order().to_vec();
        expected.sort_unstable();
        assert_eq!(sorted, expected, "not a permutation: {:?}", order);
        let position: BTreeMap<NodeId, usize> =
            order.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        for &id in order {
            for p in &net.node(id).parents {
                if let Some(pos) = position.get(p) {
                    assert!(*pos < position[&id], "{} before its parent {}", id, p);
                }
            }
        }
    }

    /// D -> B, D -> C, B -> A, C -> A with ids A=0 B=1 C=2 D=3
    fn diamond() -> Network {
        let mut net = Network::new(NetworkKind::Bayesian, QueryKind::Pe);
        for name in &["A", "B", "C", "D"] {
            net.add_node(
                name,
                crate::network::NodeKind::Chance {
                    states: vec!["0".into(), "1".into()],
                    cpt: vec![],
                },
            )
            .unwrap();
        }
        net.add_edge(3, 1).unwrap();
        net.add_edge(3, 2).unwrap();
        net.add_edge(1, 0).unwrap();
        net.add_edge(2, 0).unwrap();
        net
    }

    #[test]
    fn topological_methods() -> anyhow::Result<()> {
        let mut net = diamond();
        for &method in &[
            TopoSortMethod::Dfs,
            TopoSortMethod::ReverseDfs,
            TopoSortMethod::Removal,
        ] {
            let order = net.topological_order(method)?;
            check_topological(&net, &order);
        }
        assert_eq!(net.topological_order(TopoSortMethod::Removal)?, vec![3, 1, 2, 0]);
        assert_eq!(net.topological_order(TopoSortMethod::Dfs)?, vec![3, 2, 1, 0]);
        Ok(())
    }

    #[test]
    fn topological_random() -> anyhow::Result<()> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let mut net = random_bn(&mut rng, 12, 3, 3, true);
            let mut order = net.order().to_vec();
            order.reverse();
            net.set_order(order);
            for &method in &[
                TopoSortMethod::Dfs,
                TopoSortMethod::ReverseDfs,
                TopoSortMethod::Removal,
            ] {
                let order = net.topological_order(method)?;
                check_topological(&net, &order);
            }
        }
        Ok(())
    }

    #[test]
    fn topological_cycle() {
        let mut net = diamond();
        net.add_edge(0, 3).unwrap();
        assert!(net.topological_order(TopoSortMethod::Dfs).is_err());
        assert!(net.topological_order(TopoSortMethod::Removal).is_err());
    }

    #[test]
    fn pruning_keeps_ancestors() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        for _ in 0..30 {
            let mut net = random_bn(&mut rng, 15, 2, 2, true);
            let original = net.order().len();
            let observed = rand::Rng::gen_range(&mut rng, 0..15);
            net.add_evidence(observed, 0).unwrap();
            let ancestors = net.ancestors(&[observed]);
            net.prune();
            assert!(net.order().len() <= original);
            for id in ancestors.ones() {
                assert!(net.order().contains(&id), "ancestor {} was pruned", id);
            }
            for &id in net.order() {
                assert!(ancestors[id]);
            }
        }
    }

    #[test]
    fn pruning_without_evidence() {
        let mut net = two_nodes();
        assert_eq!(net.prune(), 2);
        assert!(net.order().is_empty());
    }

    #[test]
    fn sdp_decision_only() -> anyhow::Result<()> {
        // A -> B, C -> D; evidence on B, decision on D
        let mut net = Network::new(NetworkKind::Bayesian, QueryKind::Sdp);
        let a = net.add_chance("A", &["0", "1"], &[], vec![vec![0.5, 0.5]])?;
        let b = net.add_chance("B", &["0", "1"], &[a], vec![vec![0.5, 0.5]; 2])?;
        let c = net.add_chance("C", &["0", "1"], &[], vec![vec![0.5, 0.5]])?;
        let d = net.add_chance("D", &["0", "1"], &[c], vec![vec![0.5, 0.5]; 2])?;
        let e = net.add_chance("E", &["0", "1"], &[d], vec![vec![0.5, 0.5]; 2])?;
        net.add_evidence(b, 1)?;
        net.sdp = Some(crate::network::SdpQuery {
            decisions: vec![(d, 1)],
            unobserved: vec![],
            threshold: 0.5,
        });
        net.prune();
        assert_eq!(net.order(), &[a, b, c, d]);
        assert!(!net.node(a).marks.decision_only);
        assert!(net.node(c).marks.decision_only);
        assert!(net.node(d).marks.decision_only);
        assert!(!net.order().contains(&e));
        Ok(())
    }

    #[test]
    fn influence_relevance() -> anyhow::Result<()> {
        let mut net = umbrella();
        let extra = net.add_chance("X", &["0", "1"], &[], vec![vec![0.5, 0.5]])?;
        net.prune();
        assert_eq!(net.order().len(), 3);
        assert!(!net.order().contains(&extra));
        Ok(())
    }

    #[test]
    fn components() -> anyhow::Result<()> {
        let mut net = Network::new(NetworkKind::Bayesian, QueryKind::Sdp);
        let a = net.add_chance("A", &["0", "1"], &[], vec![vec![0.5, 0.5]])?;
        let b = net.add_chance("B", &["0", "1"], &[a], vec![vec![0.5, 0.5]; 2])?;
        let c = net.add_chance("C", &["0", "1"], &[], vec![vec![0.5, 0.5]])?;
        let d = net.add_chance("D", &["0", "1"], &[c, b], vec![vec![0.5, 0.5]; 4])?;
        let e = net.add_chance("E", &["0", "1"], &[], vec![vec![0.5, 0.5]])?;
        assert_eq!(net.connected_components(), 2);
        assert_eq!(net.node(a).marks.component, net.node(d).marks.component);
        assert_ne!(net.node(a).marks.component, net.node(e).marks.component);
        assert_eq!(net.isolate_component(e), 4);
        assert_eq!(net.order(), &[e]);
        assert!(net.node(e).marks.cared);
        assert!(!net.node(b).marks.cared);
        Ok(())
    }

    #[test]
    fn minfill_chain() -> anyhow::Result<()> {
        let mut net = Network::new(NetworkKind::Bayesian, QueryKind::Pe);
        let a = net.add_chance("A", &["0", "1"], &[], vec![vec![0.5, 0.5]])?;
        let b = net.add_chance("B", &["0", "1"], &[a], vec![vec![0.5, 0.5]; 2])?;
        net.add_chance("C", &["0", "1"], &[b], vec![vec![0.5, 0.5]; 2])?;
        assert_eq!(net.minfill_order(), vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn minfill_prefers_cheap_fill() -> anyhow::Result<()> {
        // A and B are parents of C: eliminating C first costs |A|*|B|, eliminating A costs 0.
        let mut net = Network::new(NetworkKind::Bayesian, QueryKind::Pe);
        let a = net.add_chance("A", &["0", "1", "2"], &[], vec![vec![0.2, 0.3, 0.5]])?;
        let b = net.add_chance("B", &["0", "1"], &[], vec![vec![0.5, 0.5]])?;
        let c = net.add_chance("C", &["0", "1"], &[a, b], vec![vec![0.5, 0.5]; 6])?;
        let order = net.minfill_order();
        assert_eq!(order, vec![a, b, c]);
        Ok(())
    }

    #[test]
    fn minfill_permutation() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        for _ in 0..20 {
            let mut net = random_bn(&mut rng, 14, 3, 4, true);
            net.add_evidence(13, 0).unwrap();
            net.prune();
            let mut order = net.minfill_order();
            order.sort_unstable();
            let mut expected = net.order().to_vec();
            expected.sort_unstable();
            assert_eq!(order, expected);
        }
    }

    #[test]
    fn decision_levels() -> anyhow::Result<()> {
        // C1 -> D1 -> C2 -> D2, utility on D2 and C2
        let mut net = Network::new(NetworkKind::Influence, QueryKind::Meu);
        let c1 = net.add_chance("C1", &["0", "1"], &[], vec![vec![0.5, 0.5]])?;
        let d1 = net.add_decision("D1", &["0", "1"], &[c1])?;
        let c2 = net.add_chance("C2", &["0", "1"], &[d1], vec![vec![0.5, 0.5]; 2])?;
        let d2 = net.add_decision("D2", &["0", "1"], &[c2])?;
        net.add_utility("U", &[c2, d2], vec![1.0, 2.0, 3.0, 4.0])?;
        net.topological_sort(TopoSortMethod::Dfs)?;
        let levels = net.assign_decision_levels();
        assert_eq!(levels.max, 2);
        assert_eq!(levels.at(1), &[d2]);
        assert_eq!(levels.at(2), &[d1]);
        assert_eq!(net.node(c1).marks.decision_level, 2);
        assert_eq!(net.node(c2).marks.decision_level, 1);
        Ok(())
    }

    #[test]
    fn method_names() -> anyhow::Result<()> {
        for name in TopoSortMethod::VARIANTS {
            name.parse::<TopoSortMethod>()?;
        }
        assert!("bfs".parse::<TopoSortMethod>().is_err());
        Ok(())
    }
}
