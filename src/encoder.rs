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

//! Compilation of a network and its query into a quantified formula.
//!
//! [`Encoder::compile`] runs the phases in a fixed order: preparation of the network
//! (mutilation, topological sort, pruning, component isolation, relabeling, utility
//! normalization), state variables, conditional probability tables and observations,
//! utilities, evidence and finally the SDP threshold. The result is an [`Encoding`], which
//! records which variable plays which role so that [`crate::writer`] can build the quantifier
//! prefix.

use crate::aig::{Abc, Synthesizer, TwoLevel};
use crate::bits::{ceil_log2, Selector};
use crate::cube::{merge_adjacent, Cube};
use crate::graph::{DecisionLevels, TopoSortMethod};
use crate::minimize::{Minimizer, MinimizerKind};
use crate::network::{Network, NetworkKind, NodeId, QueryKind};
use crate::utility::UtilityScaling;
use anyhow::Context;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::str::FromStr;
use varisat_formula::{CnfFormula, ExtendFormula, Lit, Var};

/// How the states of a node are represented by boolean variables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEncoding {
    /// one variable per state, exactly one of them true (a single variable for two states)
    OneHot,
    /// `ceil(log2(k))` variables, every state is a sign pattern
    Log,
}

impl StateEncoding {
    /// Accepted names
    pub const VARIANTS: &'static [&'static str] = &["one-hot", "log"];
}

impl FromStr for StateEncoding {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "one-hot" | "onehot" => Ok(StateEncoding::OneHot),
            "log" | "binary" => Ok(StateEncoding::Log),
            _ => anyhow::bail!("unknown state encoding {}", s),
        }
    }
}

/// Which sign patterns the states of a log encoded node get
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateOrder {
    /// state `i` is the binary value `i`
    Ascending,
    /// state `i` is the binary value `2^k - 1 - i`
    Descending,
}

impl StateOrder {
    /// Accepted names
    pub const VARIANTS: &'static [&'static str] = &["ascending", "descending"];
}

impl FromStr for StateOrder {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "ascending" | "0" => Ok(StateOrder::Ascending),
            "descending" | "1" => Ok(StateOrder::Descending),
            _ => anyhow::bail!("unknown state order {}", s),
        }
    }
}

/// How conditional probability tables are turned into clauses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// one weight variable per distinct value of the table
    Direct,
    /// rows as chains of normalized "continue" probabilities
    RowMutex,
    /// binary expansion of values on per table bit variables read through a selector
    BitShare,
    /// values grouped into pattern sets minimized by the [`Minimizer`]
    Minimized,
    /// bit decomposition as multi-output sums of products
    BitSop,
    /// bit decomposition as and-inverter graphs
    BitAig,
}

impl Strategy {
    /// Accepted names
    pub const VARIANTS: &'static [&'static str] = &[
        "direct",
        "row-mutex",
        "bit-share",
        "minimized",
        "bit-sop",
        "bit-aig",
    ];

    /// Whether the strategy works on patterns of log encoded states
    pub fn needs_log_states(self) -> bool {
        !matches!(self, Strategy::Direct | Strategy::RowMutex)
    }

    /// Whether the strategy decomposes values into bits
    pub fn is_bitwise(self) -> bool {
        matches!(self, Strategy::BitShare | Strategy::BitSop | Strategy::BitAig)
    }
}

impl FromStr for Strategy {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "direct" | "val" => Ok(Strategy::Direct),
            "row-mutex" | "sbk05" => Ok(Strategy::RowMutex),
            "bit-share" | "share_bit" => Ok(Strategy::BitShare),
            "minimized" | "bklm16" => Ok(Strategy::Minimized),
            "bit-sop" | "bit_sop" => Ok(Strategy::BitSop),
            "bit-aig" | "bit_aig" => Ok(Strategy::BitAig),
            _ => anyhow::bail!("unknown encoding method {}", s),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::Direct => "direct",
            Strategy::RowMutex => "row-mutex",
            Strategy::BitShare => "bit-share",
            Strategy::Minimized => "minimized",
            Strategy::BitSop => "bit-sop",
            Strategy::BitAig => "bit-aig",
        };
        write!(f, "{}", name)
    }
}

/// Which [`Synthesizer`] builds the circuits of the `bit-aig` strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesizerKind {
    /// [`TwoLevel`] with the configured minimizer
    TwoLevel,
    /// [`Abc`]
    Abc,
}

impl SynthesizerKind {
    /// Accepted names
    pub const VARIANTS: &'static [&'static str] = &["two-level", "abc"];
}

impl FromStr for SynthesizerKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "two-level" => Ok(SynthesizerKind::TwoLevel),
            "abc" => Ok(SynthesizerKind::Abc),
            _ => anyhow::bail!("unknown synthesizer {}", s),
        }
    }
}

/// Knobs of the compilation
#[derive(Debug, Clone)]
pub struct EncoderOptions {
    /// CPT encoding
    pub strategy: Strategy,
    /// state variables
    pub state_encoding: StateEncoding,
    /// patterns of log encoded states
    pub state_order: StateOrder,
    /// minimizer of pattern sets
    pub minimizer: MinimizerKind,
    /// circuit synthesis for `bit-aig`
    pub synthesizer: SynthesizerKind,
    /// maximum number of bits of a binary expansion
    pub bit_budget: usize,
    /// values closer than this are identified, values within half of it from 0 or 1 are
    /// snapped
    pub tolerance: f64,
    /// tables with at most this many entries are not decomposed into bits
    pub bit_table_threshold: usize,
    /// drop the nodes irrelevant to the query
    pub prune: bool,
    /// for SDP, keep only the connected component of the decision
    pub isolate_component: bool,
    /// reuse weight variables of parent tables when conditions are exclusive
    pub share_across_tables: bool,
    /// merge all utilities into one before encoding them
    pub super_utility: bool,
    /// topological sort used to order nodes
    pub topo_method: TopoSortMethod,
    /// allocate state variables in min-fill elimination order
    pub minfill: bool,
    /// espresso executable
    pub espresso: PathBuf,
    /// abc executable
    pub abc: PathBuf,
    /// aigtoaig executable
    pub aigtoaig: PathBuf,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        EncoderOptions {
            strategy: Strategy::Direct,
            state_encoding: StateEncoding::Log,
            state_order: StateOrder::Descending,
            minimizer: MinimizerKind::None,
            synthesizer: SynthesizerKind::TwoLevel,
            bit_budget: 32,
            tolerance: 1e-16,
            bit_table_threshold: 255,
            prune: false,
            isolate_component: false,
            share_across_tables: false,
            super_utility: false,
            topo_method: TopoSortMethod::Dfs,
            minfill: false,
            espresso: "espresso".into(),
            abc: "abc".into(),
            aigtoaig: "aigtoaig".into(),
        }
    }
}

/// Weight of a randomized variable
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Weight {
    /// probability of being true
    Prob(f64),
    /// structural variable: probability 0.5 in SSAT, compensated by the scale, and no weight
    /// in weighted model counting
    Uniform,
}

impl Weight {
    /// Probability of being true in the SSAT formula
    pub fn probability(self) -> f64 {
        match self {
            Weight::Prob(p) => p,
            Weight::Uniform => 0.5,
        }
    }
}

/// The variables of a chance or decision node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStates {
    /// state variables
    pub vars: Vec<Var>,
    /// the pattern of each state on `vars`
    pub cubes: Vec<Cube>,
    /// merged patterns denoting no state, forbidden
    pub unused: Vec<Cube>,
    /// causal edge control: when false the table of the node does not apply
    pub edge: Option<Var>,
}

impl NodeStates {
    /// Literals that hold exactly in state `state`
    pub fn literals(&self, state: usize) -> Vec<Lit> {
        self.cubes[state].literals(&self.vars)
    }

    /// The literal enabling the table of the node, if any
    pub fn enabled(&self) -> Option<Lit> {
        self.edge.map(|e| e.positive())
    }
}

/// The clause `condition -> consequent`
pub fn implication(condition: &[Lit], consequent: &[Lit]) -> Vec<Lit> {
    condition
        .iter()
        .map(|&l| !l)
        .chain(consequent.iter().copied())
        .collect()
}

/// Mutable state threaded through all the encoding phases
pub(crate) struct EncoderState {
    pub(crate) formula: CnfFormula,
    pub(crate) var_count: usize,
    pub(crate) nodes: Vec<Option<NodeStates>>,
    pub(crate) states: Vec<Var>,
    pub(crate) decisions: Vec<Var>,
    pub(crate) random: Vec<(Var, Weight)>,
    pub(crate) tseitin: Vec<Var>,
    pub(crate) observations: BTreeMap<NodeId, Vec<(Var, Weight)>>,
    pub(crate) observed: BTreeSet<Var>,
    pub(crate) observation_scale_log2: f64,
    pub(crate) utility_selector: Option<Selector>,
    pub(crate) utility_weights: Vec<(Var, f64)>,
    pub(crate) threshold: Option<Var>,
    /// per node, weight literal of each value key
    pub(crate) pools: Vec<BTreeMap<i64, Lit>>,
    /// conditions under which each shared weight variable is read
    pub(crate) uses: BTreeMap<Var, Vec<(NodeId, Vec<Lit>)>>,
    pub(crate) bit_tables: usize,
}

impl EncoderState {
    fn new(nodes: usize) -> EncoderState {
        EncoderState {
            formula: CnfFormula::new(),
            var_count: 0,
            nodes: vec![None; nodes],
            states: Vec::new(),
            decisions: Vec::new(),
            random: Vec::new(),
            tseitin: Vec::new(),
            observations: BTreeMap::new(),
            observed: BTreeSet::new(),
            observation_scale_log2: 0.,
            utility_selector: None,
            utility_weights: Vec::new(),
            threshold: None,
            pools: vec![BTreeMap::new(); nodes],
            uses: BTreeMap::new(),
            bit_tables: 0,
        }
    }

    pub(crate) fn new_var(&mut self) -> Var {
        let v = Var::from_index(self.var_count);
        self.var_count += 1;
        v
    }

    pub(crate) fn random_var(&mut self, weight: Weight) -> Var {
        let v = self.new_var();
        self.random.push((v, weight));
        v
    }

    pub(crate) fn tseitin_var(&mut self) -> Var {
        let v = self.new_var();
        self.tseitin.push(v);
        v
    }

    pub(crate) fn add_clause(&mut self, clause: &[Lit]) {
        self.formula.add_clause(clause);
    }

    pub(crate) fn node_states(&self, id: NodeId) -> anyhow::Result<&NodeStates> {
        self.nodes
            .get(id)
            .and_then(|s| s.as_ref())
            .with_context(|| format!("node {} has no state variables", id))
    }
}

/// One run of the encoder on a prepared network
pub(crate) struct Compilation<'a> {
    pub(crate) options: &'a EncoderOptions,
    pub(crate) minimizer: &'a dyn Minimizer,
    pub(crate) synthesizer: &'a dyn Synthesizer,
    pub(crate) network: &'a Network,
    pub(crate) state: EncoderState,
}

impl<'a> Compilation<'a> {
    fn encode_states(&mut self, id: NodeId) {
        let node = self.network.node(id);
        let k = node.num_states();
        let edge = if node.is_chance() && self.network.causal {
            Some(self.state.tseitin_var())
        } else {
            None
        };
        let (vars, cubes, unused) = match self.options.state_encoding {
            StateEncoding::OneHot if k == 2 => {
                let v = self.state.new_var();
                let cubes = vec![Cube(vec![Some(false)]), Cube(vec![Some(true)])];
                (vec![v], cubes, Vec::new())
            }
            StateEncoding::OneHot => {
                let vars: Vec<Var> = (0..k).map(|_| self.state.new_var()).collect();
                for (i, a) in vars.iter().enumerate() {
                    for b in &vars[i + 1..] {
                        self.state.add_clause(&[a.negative(), b.negative()]);
                    }
                }
                let at_least_one: Vec<Lit> = vars.iter().map(|v| v.positive()).collect();
                self.state.add_clause(&at_least_one);
                let cubes = (0..k)
                    .map(|i| {
                        let mut c = Cube::full(k);
                        c.0[i] = Some(true);
                        c
                    })
                    .collect();
                (vars, cubes, Vec::new())
            }
            StateEncoding::Log => {
                let width = ceil_log2(k);
                let vars: Vec<Var> = (0..width).map(|_| self.state.new_var()).collect();
                let last = (1usize << width) - 1;
                let pattern = |i: usize| match self.options.state_order {
                    StateOrder::Ascending => Cube::from_bits(i, width),
                    StateOrder::Descending => Cube::from_bits(last - i, width),
                };
                let cubes: Vec<Cube> = (0..k).map(pattern).collect();
                let unused = merge_adjacent((k..=last).map(pattern).collect());
                let guard = edge.map(|e| e.negative());
                for cube in &unused {
                    self.state.add_clause(&cube.blocking_clause(&vars, guard));
                }
                (vars, cubes, unused)
            }
        };
        if node.is_decision() {
            self.state.decisions.extend(vars.iter().copied());
        } else {
            self.state.states.extend(vars.iter().copied());
        }
        tracing::trace!(node = %node.name, states = k, vars = vars.len(), "state variables");
        self.state.nodes[id] = Some(NodeStates {
            vars,
            cubes,
            unused,
            edge,
        });
    }

    /// Uniform variables choosing which utility is read. Unused patterns are forbidden.
    fn encode_utility_selector(&mut self) {
        let count = self.network.utilities().len();
        let vars: Vec<Var> = (0..Selector::width(count))
            .map(|_| self.state.new_var())
            .collect();
        let selector = Selector::new(vars, count);
        for cube in selector.unused() {
            self.state
                .add_clause(&cube.blocking_clause(&selector.vars, None));
        }
        self.state.utility_selector = Some(selector);
    }

    /// Randomized observation variables of the chance parents of a decision.
    ///
    /// Under one-hot encoding, a chain of variables with normalized probabilities `1/k`
    /// selects the observed state. Under log encoding, the state variables of the parent are
    /// themselves observed with probability 0.5 (or copies of them in causal mode). The
    /// uniform distribution introduced this way is compensated by the scale.
    fn encode_observations(&mut self, id: NodeId) -> anyhow::Result<()> {
        let node = self.network.node(id);
        let mut observed = Vec::new();
        for &p in &node.parents {
            if !self.network.node(p).is_chance() {
                continue;
            }
            let parent = self.state.node_states(p)?.clone();
            match self.options.state_encoding {
                StateEncoding::OneHot => {
                    let k = parent.cubes.len();
                    let share = 1. / k as f64;
                    let mut remaining = 1.;
                    let mut previous: Vec<Lit> = Vec::new();
                    for state in 0..k {
                        let lits = parent.literals(state);
                        if state + 1 < k {
                            let o = self.state.new_var();
                            observed.push((o, Weight::Prob(share / remaining)));
                            remaining -= share;
                            for &l in &lits {
                                let mut clause = previous.clone();
                                clause.extend_from_slice(&[o.negative(), l]);
                                self.state.add_clause(&clause);
                            }
                            previous.push(o.positive());
                        } else {
                            for &l in &lits {
                                let mut clause = previous.clone();
                                clause.push(l);
                                self.state.add_clause(&clause);
                            }
                        }
                    }
                    self.state.observation_scale_log2 += (k as f64).log2();
                }
                StateEncoding::Log => {
                    for &v in &parent.vars {
                        if self.network.causal {
                            let o = self.state.new_var();
                            self.state.add_clause(&[v.positive(), o.negative()]);
                            self.state.add_clause(&[v.negative(), o.positive()]);
                            observed.push((o, Weight::Uniform));
                        } else if self.state.observed.insert(v) {
                            observed.push((v, Weight::Uniform));
                        }
                    }
                }
            }
        }
        tracing::trace!(decision = %node.name, observations = observed.len(), "observations");
        self.state.observations.insert(id, observed);
        Ok(())
    }

    /// Unit clauses binding evidence, and the causal edge of every chance node.
    fn encode_evidence(&mut self) -> anyhow::Result<()> {
        for &(id, state) in &self.network.evidence {
            let lits = self.state.node_states(id)?.literals(state);
            for l in lits {
                self.state.add_clause(&[l]);
            }
        }
        if self.network.causal {
            for &id in self.network.order() {
                if let Some(edge) = self.state.node_states(id)?.edge {
                    let intervened = self.network.evidence_state(id).is_some();
                    self.state.add_clause(&[Lit::from_var(edge, !intervened)]);
                }
            }
        }
        Ok(())
    }

    /// The threshold variable implies the decision state.
    fn encode_sdp(&mut self) -> anyhow::Result<()> {
        let sdp = self.network.sdp.as_ref().context("SDP query without decision")?;
        let &(id, state) = sdp
            .decisions
            .first()
            .context("the SDP decision node was dropped")?;
        let threshold = self.state.threshold.context("no threshold variable")?;
        for l in self.state.node_states(id)?.literals(state) {
            self.state.add_clause(&[threshold.negative(), l]);
        }
        Ok(())
    }
}

/// Compiles networks with fixed options
pub struct Encoder {
    options: EncoderOptions,
    minimizer: Box<dyn Minimizer>,
    synthesizer: Box<dyn Synthesizer>,
}

impl Encoder {
    /// An encoder with these options
    pub fn new(options: EncoderOptions) -> Encoder {
        let minimizer = options.minimizer.build(&options.espresso);
        let synthesizer: Box<dyn Synthesizer> = match options.synthesizer {
            SynthesizerKind::TwoLevel => Box::new(TwoLevel {
                minimizer: options.minimizer.build(&options.espresso),
            }),
            SynthesizerKind::Abc => Box::new(Abc {
                abc: options.abc.clone(),
                aigtoaig: options.aigtoaig.clone(),
            }),
        };
        Encoder {
            options,
            minimizer,
            synthesizer,
        }
    }

    /// The options
    pub fn options(&self) -> &EncoderOptions {
        &self.options
    }

    fn check(&self, network: &Network) -> anyhow::Result<()> {
        network.validate()?;
        match (network.kind, network.query) {
            (NetworkKind::Influence, QueryKind::Meu) => {
                anyhow::ensure!(
                    !network.utilities().is_empty(),
                    "influence diagram without utility node"
                );
            }
            (NetworkKind::Influence, query) => {
                anyhow::bail!("{} queries are not supported on influence diagrams", query)
            }
            (NetworkKind::Bayesian, QueryKind::Meu) => {
                anyhow::bail!("MEU query on a bayesian network")
            }
            (NetworkKind::Bayesian, QueryKind::Sdp) => {
                let sdp = network.sdp.as_ref().context("SDP query without decision")?;
                anyhow::ensure!(
                    sdp.decisions.len() == 1,
                    "SDP queries with {} decisions are not supported, exactly one is required",
                    sdp.decisions.len()
                );
            }
            (NetworkKind::Bayesian, QueryKind::Map) => {
                if network.map_vars.is_empty() {
                    tracing::warn!("MAP query without query variables");
                }
            }
            _ => {}
        }
        anyhow::ensure!(
            !self.options.strategy.needs_log_states()
                || self.options.state_encoding == StateEncoding::Log,
            "strategy {} requires the log state encoding",
            self.options.strategy
        );
        anyhow::ensure!(
            self.options.tolerance > 0. && self.options.tolerance < 1.,
            "tolerance {} outside (0, 1)",
            self.options.tolerance
        );
        anyhow::ensure!(
            (1..=64).contains(&self.options.bit_budget),
            "bit budget {} outside [1, 64]",
            self.options.bit_budget
        );
        Ok(())
    }

    /// Prepares the network, then encodes it and its query.
    pub fn compile(&self, mut network: Network) -> anyhow::Result<Encoding> {
        let _span = tracing::trace_span!("encode", timing = true).entered();
        self.check(&network).context("checking the network")?;
        let total = network.order().len();
        if network.causal {
            network.mutilate()?;
        }
        network.topological_sort(self.options.topo_method)?;
        if self.options.prune {
            if network.query == QueryKind::Mpe {
                tracing::warn!("pruning changes the value of MPE queries, not pruning");
            } else {
                network.prune();
            }
        }
        if self.options.isolate_component {
            match network.sdp.as_ref().and_then(|s| s.decisions.first()) {
                Some(&(decision, _)) if network.query == QueryKind::Sdp => {
                    network.isolate_component(decision);
                }
                _ => {
                    let components = network.connected_components();
                    tracing::debug!(components, "component isolation only applies to SDP");
                }
            }
        }
        network.relabel().context("relabeling the network")?;
        let mut utility_scaling = None;
        let mut levels = DecisionLevels::default();
        if network.kind == NetworkKind::Influence {
            if self.options.super_utility {
                network.merge_utilities()?;
            }
            utility_scaling = Some(network.normalize_utilities());
            levels = network.assign_decision_levels();
        }
        tracing::trace!(
            nodes = total,
            encoded_nodes = network.order().len(),
            stats = true
        );
        tracing::debug!(
            nodes = network.order().len(),
            decision_levels = levels.max,
            "network prepared"
        );

        let mut run = Compilation {
            options: &self.options,
            minimizer: &*self.minimizer,
            synthesizer: &*self.synthesizer,
            network: &network,
            state: EncoderState::new(network.nodes().len()),
        };
        if network.query == QueryKind::Sdp {
            run.state.threshold = Some(run.state.new_var());
        }
        let allocation = if self.options.minfill && network.kind == NetworkKind::Bayesian {
            network.minfill_order()
        } else {
            network.order().to_vec()
        };
        {
            let _span = tracing::trace_span!("states", timing = true).entered();
            for id in allocation {
                run.encode_states(id);
            }
            if network.kind == NetworkKind::Influence && !self.options.super_utility {
                run.encode_utility_selector();
            }
        }
        {
            let _span = tracing::trace_span!("tables", timing = true).entered();
            for &id in network.order() {
                let node = network.node(id);
                if node.is_chance() {
                    run.encode_cpt(id)
                        .with_context(|| format!("encoding the table of {}", node.name))?;
                } else if node.is_decision() {
                    run.encode_observations(id)?;
                }
            }
            if network.kind == NetworkKind::Influence {
                run.encode_utilities().context("encoding utilities")?;
            }
        }
        run.encode_evidence()?;
        if network.query == QueryKind::Sdp {
            run.encode_sdp()?;
        }
        let mut state = run.state;
        state.formula.set_var_count(state.var_count);
        tracing::trace!(
            vars = state.var_count,
            clauses = state.formula.len(),
            bit_tables = state.bit_tables,
            stats = true
        );
        let threshold = state
            .threshold
            .zip(network.sdp.as_ref().map(|s| s.threshold));
        Ok(Encoding {
            formula: state.formula,
            nodes: state.nodes,
            states: state.states,
            decisions: state.decisions,
            random: state.random,
            tseitin: state.tseitin,
            observations: state.observations,
            observation_scale_log2: state.observation_scale_log2,
            utility_selector: state
                .utility_selector
                .map(|s| s.vars)
                .unwrap_or_default(),
            utility_weights: state.utility_weights,
            threshold,
            levels,
            utility_scaling,
            bit_tables: state.bit_tables,
            network,
        })
    }
}

/// A compiled network: the formula and the role of each of its variables
pub struct Encoding {
    /// the network as prepared for encoding: pruned, relabeled, utilities normalized
    pub network: Network,
    /// the clauses
    pub formula: CnfFormula,
    /// state variables of each node, indexed by node id
    pub nodes: Vec<Option<NodeStates>>,
    /// state variables of chance nodes
    pub states: Vec<Var>,
    /// state variables of decision nodes
    pub decisions: Vec<Var>,
    /// weight variables of the tables, bit and selector variables
    pub random: Vec<(Var, Weight)>,
    /// auxiliary variables defined by the others: causal edges, gate outputs
    pub tseitin: Vec<Var>,
    /// observation variables of each decision
    pub observations: BTreeMap<NodeId, Vec<(Var, Weight)>>,
    /// `log2` of the scale introduced by one-hot observation chains
    pub observation_scale_log2: f64,
    /// variables choosing which utility is read
    pub utility_selector: Vec<Var>,
    /// weight variables of normalized utilities
    pub utility_weights: Vec<(Var, f64)>,
    /// SDP threshold variable and value
    pub threshold: Option<(Var, f64)>,
    /// decisions per level
    pub levels: DecisionLevels,
    /// how to map normalized utilities back
    pub utility_scaling: Option<UtilityScaling>,
    /// number of tables encoded bitwise
    pub bit_tables: usize,
}

/// Counts describing an [`Encoding`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[allow(missing_docs)]
pub struct Summary {
    pub query: String,
    pub nodes: usize,
    pub vars: usize,
    pub clauses: usize,
    pub state_vars: usize,
    pub decision_vars: usize,
    pub random_vars: usize,
    pub uniform_vars: usize,
    pub observation_vars: usize,
    pub utility_vars: usize,
    pub tseitin_vars: usize,
    pub decision_levels: usize,
    pub scale_log2: f64,
    pub utility_scale: Option<f64>,
    pub utility_shift: Option<f64>,
    pub utility_count: Option<usize>,
    pub threshold: Option<f64>,
    pub bit_tables: usize,
}

impl Encoding {
    /// Number of variables
    pub fn var_count(&self) -> usize {
        self.formula.var_count()
    }

    /// State variables of a node
    pub fn node_states(&self, id: NodeId) -> Option<&NodeStates> {
        self.nodes.get(id).and_then(|s| s.as_ref())
    }

    /// State variables of the evidence nodes
    pub fn evidence_vars(&self) -> BTreeSet<Var> {
        self.network
            .evidence
            .iter()
            .filter_map(|&(id, _)| self.node_states(id))
            .flat_map(|s| s.vars.iter().copied())
            .collect()
    }

    /// Weights of the positive and negative literal of every variable for weighted model
    /// counting. Uniform and unweighted variables weigh 1 on both sides.
    pub fn literal_weights(&self) -> Vec<(f64, f64)> {
        let mut res = vec![(1., 1.); self.var_count()];
        let weighted = self
            .random
            .iter()
            .chain(self.observations.values().flatten())
            .copied()
            .chain(self.utility_weights.iter().map(|&(v, w)| (v, Weight::Prob(w))));
        for (v, w) in weighted {
            if let Weight::Prob(p) = w {
                res[v.index()] = (p, 1. - p);
            }
        }
        res
    }

    /// `log2` of the factor by which the value of the SSAT formula must be multiplied:
    /// every uniform variable of the prefix and every one-hot observation chain contribute.
    pub fn scale_log2(&self) -> anyhow::Result<f64> {
        let prefix = crate::writer::prefix(self)?;
        let uniform = prefix
            .iter()
            .filter(|(_, q)| *q == crate::writer::Quantifier::Random(Weight::Uniform))
            .count();
        Ok(uniform as f64 + self.observation_scale_log2)
    }

    /// Counts for logs and the JSON summary
    pub fn summary(&self) -> anyhow::Result<Summary> {
        let scaling = self.utility_scaling.as_ref();
        Ok(Summary {
            query: self.network.query.to_string(),
            nodes: self.network.order().len(),
            vars: self.var_count(),
            clauses: self.formula.len(),
            state_vars: self.states.len(),
            decision_vars: self.decisions.len(),
            random_vars: self.random.len(),
            uniform_vars: self
                .random
                .iter()
                .filter(|(_, w)| *w == Weight::Uniform)
                .count(),
            observation_vars: self.observations.values().map(|o| o.len()).sum(),
            utility_vars: self.utility_weights.len() + self.utility_selector.len(),
            tseitin_vars: self.tseitin.len(),
            decision_levels: self.levels.max,
            scale_log2: self.scale_log2()?,
            utility_scale: scaling.map(|s| s.scale),
            utility_shift: scaling.map(|s| s.shift),
            utility_count: scaling.map(|s| s.count),
            threshold: self.threshold.map(|(_, t)| t),
            bit_tables: self.bit_tables,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::network::NodeKind;
    use crate::testing::{two_nodes, umbrella};
    use crate::wmc::{satisfiable, weighted_count};

    fn single_node(states: usize) -> Network {
        let mut net = Network::new(NetworkKind::Bayesian, QueryKind::Pe);
        let labels: Vec<String> = (0..states).map(|s| s.to_string()).collect();
        let labels: Vec<&str> = labels.iter().map(|s| s.as_str()).collect();
        net.add_chance("X", &labels, &[], vec![vec![1. / states as f64; states]])
            .unwrap();
        net
    }

    fn options(state_encoding: StateEncoding) -> EncoderOptions {
        EncoderOptions {
            state_encoding,
            ..EncoderOptions::default()
        }
    }

    #[test]
    fn strategy_names() {
        for name in Strategy::VARIANTS {
            let s: Strategy = name.parse().unwrap();
            assert_eq!(&s.to_string(), name);
        }
        assert_eq!("bklm16".parse::<Strategy>().unwrap(), Strategy::Minimized);
        assert_eq!("sbk05".parse::<Strategy>().unwrap(), Strategy::RowMutex);
        assert!("all05".parse::<Strategy>().is_err());
        assert!("sparse".parse::<StateEncoding>().is_err());
    }

    #[test]
    fn one_hot_states_are_exclusive() {
        let enc = Encoder::new(options(StateEncoding::OneHot))
            .compile(single_node(4))
            .unwrap();
        let states = enc.node_states(0).unwrap();
        assert_eq!(states.vars.len(), 4);
        for i in 0..4 {
            for j in i + 1..4 {
                let both = [states.vars[i].positive(), states.vars[j].positive()];
                assert!(!satisfiable(&enc.formula, &both));
            }
            assert!(satisfiable(&enc.formula, &[states.vars[i].positive()]));
        }
        let none: Vec<Lit> = states.vars.iter().map(|v| v.negative()).collect();
        assert!(!satisfiable(&enc.formula, &none));
    }

    #[test]
    fn binary_one_hot_uses_one_variable() {
        let enc = Encoder::new(options(StateEncoding::OneHot))
            .compile(single_node(2))
            .unwrap();
        let states = enc.node_states(0).unwrap();
        assert_eq!(states.vars.len(), 1);
        assert_eq!(states.literals(0), vec![states.vars[0].negative()]);
        assert_eq!(states.literals(1), vec![states.vars[0].positive()]);
    }

    #[test]
    fn log_patterns_outside_domain_are_forbidden() {
        for &order in &[StateOrder::Ascending, StateOrder::Descending] {
            let enc = Encoder::new(EncoderOptions {
                state_order: order,
                ..EncoderOptions::default()
            })
            .compile(single_node(5))
            .unwrap();
            let states = enc.node_states(0).unwrap();
            assert_eq!(states.vars.len(), 3);
            let mut bound = 0;
            for value in 0..8 {
                let cube = Cube::from_bits(value, 3);
                let feasible = satisfiable(&enc.formula, &cube.literals(&states.vars));
                let is_state = states.cubes.contains(&cube);
                assert_eq!(feasible, is_state, "{:?} pattern {}", order, cube);
                bound += is_state as usize;
            }
            assert_eq!(bound, 5);
        }
        let enc = Encoder::new(EncoderOptions::default())
            .compile(single_node(3))
            .unwrap();
        assert_eq!(enc.node_states(0).unwrap().cubes[0], Cube::from_bits(3, 2));
    }

    #[test]
    fn probability_of_evidence() {
        for &encoding in &[StateEncoding::OneHot, StateEncoding::Log] {
            let mut net = two_nodes();
            net.add_evidence(1, 1).unwrap();
            let enc = Encoder::new(options(encoding)).compile(net).unwrap();
            let count = weighted_count(&enc.formula, &enc.literal_weights());
            assert!((count - 0.5).abs() < 1e-12, "{:?}: {}", encoding, count);
            // split by the state of the root
            let root = enc.node_states(0).unwrap();
            let mut parts = Vec::new();
            for state in 0..2 {
                let mut f = enc.formula.clone();
                for l in root.literals(state) {
                    f.add_clause(&[l]);
                }
                parts.push(weighted_count(&f, &enc.literal_weights()));
            }
            assert!((parts[0] - 0.5 * 0.2).abs() < 1e-12);
            assert!((parts[1] - 0.5 * 0.8).abs() < 1e-12);
        }
    }

    #[test]
    fn multiple_sdp_decisions_are_rejected() {
        let mut net = two_nodes();
        net.query = QueryKind::Sdp;
        net.sdp = Some(crate::network::SdpQuery {
            decisions: vec![(0, 0), (1, 1)],
            unobserved: vec![],
            threshold: 0.5,
        });
        let err = Encoder::new(EncoderOptions::default())
            .compile(net)
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("decisions"));
    }

    #[test]
    fn minimization_requires_log_states() {
        let enc = Encoder::new(EncoderOptions {
            strategy: Strategy::Minimized,
            state_encoding: StateEncoding::OneHot,
            ..EncoderOptions::default()
        });
        assert!(enc.compile(two_nodes()).is_err());
    }

    #[test]
    fn sdp_threshold_implies_decision() {
        let mut net = two_nodes();
        net.query = QueryKind::Sdp;
        net.sdp = Some(crate::network::SdpQuery {
            decisions: vec![(1, 1)],
            unobserved: vec![0],
            threshold: 0.7,
        });
        let enc = Encoder::new(EncoderOptions::default())
            .compile(net)
            .unwrap();
        let (thr, value) = enc.threshold.unwrap();
        assert_eq!(thr, Var::from_index(0));
        assert_eq!(value, 0.7);
        let decision = enc.node_states(1).unwrap().literals(0);
        let mut assumptions = decision.clone();
        assumptions.push(thr.positive());
        assert!(!satisfiable(&enc.formula, &assumptions));
        assert!(satisfiable(&enc.formula, &decision));
    }

    #[test]
    fn causal_edges() {
        let mut net = two_nodes();
        net.causal = true;
        net.add_evidence(1, 1).unwrap();
        let enc = Encoder::new(EncoderOptions::default())
            .compile(net)
            .unwrap();
        assert_eq!(enc.tseitin.len(), 2);
        let root = enc.node_states(0).unwrap().edge.unwrap();
        let child = enc.node_states(1).unwrap().edge.unwrap();
        assert!(!satisfiable(&enc.formula, &[root.negative()]));
        assert!(!satisfiable(&enc.formula, &[child.positive()]));
        // intervening on C leaves the distribution of R alone
        let count = weighted_count(&enc.formula, &enc.literal_weights());
        assert!((count - 1.).abs() < 1e-12, "{}", count);
    }

    #[test]
    fn decisions_get_observations() {
        for &encoding in &[StateEncoding::OneHot, StateEncoding::Log] {
            let enc = Encoder::new(options(encoding)).compile(umbrella()).unwrap();
            let d = enc.network.id_of("D").unwrap();
            assert_eq!(enc.observations[&d].len(), 1);
            assert_eq!(enc.levels.max, 1);
            assert_eq!(enc.utility_selector.len(), 1);
            assert_eq!(enc.decisions.len(), 1);
            let scaling = enc.utility_scaling.unwrap();
            assert_eq!(scaling.count, 2);
        }
    }

    #[test]
    fn minfill_allocation_keeps_variables() {
        let mut rng = <rand::rngs::StdRng as rand::SeedableRng>::seed_from_u64(3);
        let net = crate::testing::random_bn(&mut rng, 6, 2, 3, false);
        let plain = Encoder::new(EncoderOptions::default())
            .compile(net.clone())
            .unwrap();
        let reordered = Encoder::new(EncoderOptions {
            minfill: true,
            ..EncoderOptions::default()
        })
        .compile(net)
        .unwrap();
        assert_eq!(plain.var_count(), reordered.var_count());
        assert_eq!(plain.formula.len(), reordered.formula.len());
        let a = weighted_count(&plain.formula, &plain.literal_weights());
        let b = weighted_count(&reordered.formula, &reordered.literal_weights());
        assert!((a - 1.).abs() < 1e-9 && (b - 1.).abs() < 1e-9);
    }

    #[test]
    fn pruning_drops_unrelated_nodes() {
        let mut net = two_nodes();
        net.add_chance("Z", &["0", "1"], &[], vec![vec![0.3, 0.7]])
            .unwrap();
        net.add_evidence(1, 0).unwrap();
        let enc = Encoder::new(EncoderOptions {
            prune: true,
            ..EncoderOptions::default()
        })
        .compile(net)
        .unwrap();
        assert_eq!(enc.network.order().len(), 2);
        assert!(enc.network.id_of("Z").is_none());
        let count = weighted_count(&enc.formula, &enc.literal_weights());
        assert!((count - 0.5).abs() < 1e-12);
        assert!(matches!(
            enc.network.node(0).kind,
            NodeKind::Chance { .. }
        ));
    }
}
