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

//! Encodings of conditional probability tables and utility tables.
//!
//! Every table entry is a pattern: the states of the parents and of the node itself. An entry
//! of value `p` is encoded by the clause "pattern implies a variable of weight `p`", which is
//! sound because exactly one pattern of a table holds in any assignment of its variables.
//! Entries of value 0 forbid their pattern, entries of value 1 need no clause.

use crate::aig::{Aig, Signal, Synthesizer};
use crate::bits::{binary_expansion, Selector};
use crate::cube::{literals_conflict, merge_adjacent, Cube};
use crate::encoder::{implication, Compilation, EncoderState, NodeStates, Strategy, Weight};
use crate::minimize::{Cover, Minimizer};
use crate::network::NodeId;
use anyhow::Context;
use std::collections::BTreeMap;
use varisat_formula::{Lit, Var};

/// Identifies values closer than `tolerance`
fn value_key(p: f64, tolerance: f64) -> i64 {
    (p / tolerance).round() as i64
}

/// The variables of a table and the pattern of each of its entries
struct Table {
    vars: Vec<Var>,
    /// literal enabling the whole table
    enabled: Option<Lit>,
    entries: Vec<(Cube, f64)>,
    /// patterns in which some node is in no state
    dont_care: Vec<Cube>,
}

impl Table {
    /// Literals of `enabled` and of `cube` on the table variables, then `extra`
    fn condition(&self, cube: &Cube, extra: &[Lit]) -> Vec<Lit> {
        self.enabled
            .into_iter()
            .chain(cube.literals(&self.vars))
            .chain(extra.iter().copied())
            .collect()
    }
}

/// Value of an entry once decomposed into bits
enum Entry {
    Zero,
    One,
    Bits(Vec<bool>),
}

/// Groups of patterns keyed by value
type ValueGroups = BTreeMap<i64, (f64, Vec<Cube>)>;

/// Where the weight variables of value groups go
#[derive(Clone, Copy)]
enum Target {
    /// randomized variables of the table of this node, shared when possible
    Table(NodeId),
    /// one utility variable per value
    Utility,
}

/// Per table bit variables and the selector reading them
struct BitVars {
    bits: Vec<Var>,
    selector: Selector,
}

/// Variables and don't care set of the concatenated states of `groups`
fn layout(groups: &[&NodeStates]) -> (Vec<Var>, Vec<Cube>) {
    let width: usize = groups.iter().map(|g| g.vars.len()).sum();
    let mut vars = Vec::with_capacity(width);
    let mut dont_care = Vec::new();
    for g in groups {
        let offset = vars.len();
        for unused in &g.unused {
            let rest = width - offset - unused.width();
            dont_care.push(
                Cube::full(offset)
                    .concat(unused)
                    .concat(&Cube::full(rest)),
            );
        }
        vars.extend(g.vars.iter().copied());
    }
    (vars, dont_care)
}

/// The pattern of a combination of states of `groups`
fn combination_cube(groups: &[&NodeStates], combination: &[usize]) -> Cube {
    groups
        .iter()
        .zip(combination)
        .fold(Cube::full(0), |acc, (g, &s)| acc.concat(&g.cubes[s]))
}

/// Clones the states of `ids`
fn states_of(state: &EncoderState, ids: &[NodeId]) -> anyhow::Result<Vec<NodeStates>> {
    ids.iter()
        .map(|&id| state.node_states(id).map(Clone::clone))
        .collect()
}

impl<'a> Compilation<'a> {
    fn is_zero(&self, p: f64) -> bool {
        p <= self.options.tolerance / 2.
    }

    fn is_one(&self, p: f64) -> bool {
        p >= 1. - self.options.tolerance / 2.
    }

    fn chance_table(&self, id: NodeId) -> anyhow::Result<Table> {
        let network = self.network;
        let node = network.node(id);
        let cpt = node.cpt().context("not a chance node")?;
        let mut ids = node.parents.clone();
        ids.push(id);
        let states = states_of(&self.state, &ids)?;
        let groups: Vec<&NodeStates> = states.iter().collect();
        let (vars, dont_care) = layout(&groups);
        let (own, parents) = groups.split_last().context("empty table")?;
        let mut entries = Vec::with_capacity(cpt.len() * node.num_states());
        for (combination, row) in network.parent_combinations(id).iter().zip(cpt) {
            let condition = combination_cube(parents, combination);
            for (state, &p) in row.iter().enumerate() {
                entries.push((condition.concat(&own.cubes[state]), p));
            }
        }
        Ok(Table {
            vars,
            enabled: own.enabled(),
            entries,
            dont_care,
        })
    }

    /// The table of utility `u`, prefixed by the selector pattern `selected` if any
    fn utility_table(&self, u: NodeId, selected: Option<(&Selector, usize)>) -> anyhow::Result<Table> {
        let network = self.network;
        let node = network.node(u);
        let values = node.utility_values().context("not a utility node")?;
        let states = states_of(&self.state, &node.parents)?;
        let groups: Vec<&NodeStates> = states.iter().collect();
        let (parent_vars, parent_dont_care) = layout(&groups);
        let (vars, prefix, dont_care) = match selected {
            Some((selector, j)) => {
                let width = parent_vars.len();
                let mut dont_care: Vec<Cube> = selector
                    .unused()
                    .iter()
                    .map(|c| c.concat(&Cube::full(width)))
                    .collect();
                let free = Cube::full(selector.vars.len());
                dont_care.extend(parent_dont_care.iter().map(|c| free.concat(c)));
                let vars: Vec<Var> = selector.vars.iter().chain(parent_vars.iter()).copied().collect();
                (vars, selector.cube(j), dont_care)
            }
            None => (parent_vars, Cube::full(0), parent_dont_care),
        };
        let entries = network
            .parent_combinations(u)
            .iter()
            .zip(values)
            .map(|(combination, &v)| (prefix.concat(&combination_cube(&groups, combination)), v))
            .collect();
        Ok(Table {
            vars,
            enabled: None,
            entries,
            dont_care,
        })
    }

    /// The conditions of each row of the table of `id`: enabling literal and parent states
    fn row_conditions(&self, id: NodeId) -> anyhow::Result<Vec<Vec<Lit>>> {
        let network = self.network;
        let node = network.node(id);
        let parents = states_of(&self.state, &node.parents)?;
        let enabled = self.state.node_states(id)?.enabled();
        Ok(network
            .parent_combinations(id)
            .iter()
            .map(|combination| {
                enabled
                    .into_iter()
                    .chain(
                        parents
                            .iter()
                            .zip(combination)
                            .flat_map(|(p, &s)| p.literals(s)),
                    )
                    .collect()
            })
            .collect())
    }

    /// Whether `var` can be read under all of `conditions`: they must exclude every condition
    /// under which other tables read it.
    fn compatible(&self, var: Var, owner: NodeId, conditions: &[Vec<Lit>]) -> bool {
        self.state.uses.get(&var).map_or(true, |uses| {
            uses.iter()
                .filter(|(o, _)| *o != owner)
                .all(|(_, used)| conditions.iter().all(|c| literals_conflict(used, c)))
        })
    }

    /// The literal of weight `p` for the table of `owner`, read under `conditions`.
    ///
    /// The variable of an equal value is reused, as is the negation of the variable of the
    /// complementary value when `complement`. With cross table sharing, the variables of
    /// the parent tables are candidates too.
    fn weight_literal(
        &mut self,
        owner: NodeId,
        pool: &mut BTreeMap<i64, Lit>,
        p: f64,
        conditions: &[Vec<Lit>],
        complement: bool,
    ) -> Lit {
        let tolerance = self.options.tolerance;
        let key = value_key(p, tolerance);
        let mut candidates: Vec<Lit> = pool.get(&key).copied().into_iter().collect();
        if complement {
            candidates.extend(pool.get(&value_key(1. - p, tolerance)).map(|&l| !l));
        }
        if self.options.share_across_tables {
            for &parent in &self.network.node(owner).parents {
                candidates.extend(self.state.pools[parent].get(&key).copied());
            }
        }
        let lit = match candidates
            .into_iter()
            .find(|l| self.compatible(l.var(), owner, conditions))
        {
            Some(l) => l,
            None => self.state.random_var(Weight::Prob(p)).positive(),
        };
        if !lit.is_negative() {
            pool.insert(key, lit);
        }
        self.state
            .uses
            .entry(lit.var())
            .or_insert_with(Vec::new)
            .extend(conditions.iter().map(|c| (owner, c.clone())));
        lit
    }

    fn minimize(&self, width: usize, cubes: Vec<Cube>, dont_care: &[Cube]) -> anyhow::Result<Vec<Cube>> {
        if cubes.len() < 2 {
            return Ok(cubes);
        }
        let mut cover = Cover::single_output(width, cubes);
        cover.dont_care = dont_care.to_vec();
        let res = self
            .minimizer
            .minimize(&cover)
            .with_context(|| format!("minimizing with {}", self.minimizer.name()))?;
        Ok(res.on_set(0))
    }

    /// Encodes the table of chance node `id` with the configured strategy. Bitwise strategies
    /// fall back to `minimized` on small tables.
    pub(crate) fn encode_cpt(&mut self, id: NodeId) -> anyhow::Result<()> {
        let node = self.network.node(id);
        let entries = node.cpt().map_or(0, |t| t.len() * node.num_states());
        let strategy = match self.options.strategy {
            s if s.is_bitwise() && entries <= self.options.bit_table_threshold => {
                Strategy::Minimized
            }
            s => s,
        };
        let clauses = self.state.formula.len();
        let vars = self.state.var_count;
        match strategy {
            Strategy::Direct => self.encode_direct(id)?,
            Strategy::RowMutex => self.encode_row_mutex(id)?,
            Strategy::Minimized => self.encode_minimized(id)?,
            Strategy::BitShare => self.encode_bit_share(id)?,
            Strategy::BitSop => self.encode_bit_function(id, false)?,
            Strategy::BitAig => self.encode_bit_function(id, true)?,
        }
        if strategy.is_bitwise() {
            self.state.bit_tables += 1;
        }
        tracing::trace!(
            node = %node.name,
            %strategy,
            entries,
            vars = self.state.var_count - vars,
            clauses = self.state.formula.len() - clauses,
            "table"
        );
        Ok(())
    }

    /// `row /\ state -> r` per entry, with `r` shared by equal and complementary values. Rows
    /// with a value 1 force the state, zeros of a row are merged.
    fn encode_direct(&mut self, id: NodeId) -> anyhow::Result<()> {
        let node = self.network.node(id);
        let cpt = node.cpt().context("not a chance node")?;
        let own = self.state.node_states(id)?.clone();
        let mut pool = BTreeMap::new();
        for (condition, row) in self.row_conditions(id)?.into_iter().zip(cpt) {
            let mut zeros = Vec::new();
            let mut forced = false;
            for (state, &p) in row.iter().enumerate() {
                let lits = own.literals(state);
                if self.is_one(p) {
                    for &l in &lits {
                        self.state.add_clause(&implication(&condition, &[l]));
                    }
                    forced = true;
                    break;
                } else if self.is_zero(p) {
                    zeros.push(own.cubes[state].clone());
                } else {
                    let mut entry = condition.clone();
                    entry.extend(lits);
                    let r = self.weight_literal(id, &mut pool, p, &[entry.clone()], true);
                    self.state.add_clause(&implication(&entry, &[r]));
                }
            }
            if !forced {
                for cube in merge_adjacent(zeros) {
                    let mut entry = condition.clone();
                    entry.extend(cube.literals(&own.vars));
                    self.state.add_clause(&implication(&entry, &[]));
                }
            }
        }
        self.state.pools[id] = pool;
        Ok(())
    }

    /// Each row is a chain: state `i` is chosen when the variables of the previous states are
    /// false and its own, of probability `p_i / (1 - p_0 - .. - p_{i-1})`, is true. The last
    /// state takes the remaining mass. Variables are shared by rows at the same position.
    fn encode_row_mutex(&mut self, id: NodeId) -> anyhow::Result<()> {
        let node = self.network.node(id);
        let cpt = node.cpt().context("not a chance node")?;
        let own = self.state.node_states(id)?.clone();
        let k = node.num_states();
        let tolerance = self.options.tolerance;
        let mut pools: Vec<BTreeMap<i64, Var>> = vec![BTreeMap::new(); k];
        for (condition, row) in self.row_conditions(id)?.into_iter().zip(cpt) {
            let mut skipped: Vec<Lit> = Vec::new();
            let mut remaining = 1.;
            for (state, &value) in row.iter().enumerate() {
                let lits = own.literals(state);
                let base = implication(&condition, &skipped);
                let with = |extra: &[Lit]| -> Vec<Lit> {
                    base.iter().chain(extra.iter()).copied().collect()
                };
                if state + 1 == k {
                    if self.is_zero(remaining) {
                        self.state.add_clause(&base);
                    } else {
                        for &l in &lits {
                            self.state.add_clause(&with(&[l]));
                        }
                    }
                    break;
                }
                let p = if self.is_zero(remaining) {
                    0.
                } else {
                    value / remaining
                };
                remaining -= value;
                if self.is_one(p) {
                    for &l in &lits {
                        self.state.add_clause(&with(&[l]));
                    }
                    break;
                } else if self.is_zero(p) {
                    continue;
                }
                let state_vars = &mut self.state;
                let r = *pools[state]
                    .entry(value_key(p, tolerance))
                    .or_insert_with(|| state_vars.random_var(Weight::Prob(p)));
                for &l in &lits {
                    self.state.add_clause(&with(&[r.negative(), l]));
                }
                skipped.push(r.positive());
            }
        }
        Ok(())
    }

    /// Entries grouped by value, each group minimized as a whole.
    fn encode_minimized(&mut self, id: NodeId) -> anyhow::Result<()> {
        let table = self.chance_table(id)?;
        let groups = self.value_groups(&table);
        self.encode_value_groups(&table, groups, Target::Table(id))
    }

    fn value_groups(&self, table: &Table) -> ValueGroups {
        let mut groups = ValueGroups::new();
        for (pattern, p) in &table.entries {
            if self.is_one(*p) {
                continue;
            }
            groups
                .entry(value_key(*p, self.options.tolerance))
                .or_insert_with(|| (*p, Vec::new()))
                .1
                .push(pattern.clone());
        }
        groups
    }

    fn encode_value_groups(
        &mut self,
        table: &Table,
        groups: ValueGroups,
        target: Target,
    ) -> anyhow::Result<()> {
        let mut pool = BTreeMap::new();
        for (_, (value, cubes)) in groups {
            let cubes = self.minimize(table.vars.len(), cubes, &table.dont_care)?;
            let conditions: Vec<Vec<Lit>> =
                cubes.iter().map(|c| table.condition(c, &[])).collect();
            if self.is_zero(value) {
                for c in &conditions {
                    self.state.add_clause(&implication(c, &[]));
                }
                continue;
            }
            let lit = match target {
                Target::Table(owner) => {
                    self.weight_literal(owner, &mut pool, value, &conditions, false)
                }
                Target::Utility => {
                    let v = self.state.new_var();
                    self.state.utility_weights.push((v, value));
                    v.positive()
                }
            };
            for c in &conditions {
                self.state.add_clause(&implication(c, &[lit]));
            }
        }
        if let Target::Table(owner) = target {
            self.state.pools[owner] = pool;
        }
        Ok(())
    }

    fn classify(&self, p: f64) -> Entry {
        let resolution = 0.5f64
            .powi(self.options.bit_budget as i32)
            .max(self.options.tolerance);
        if p >= 1. - resolution / 2. {
            return Entry::One;
        }
        let bits = binary_expansion(p, self.options.bit_budget, self.options.tolerance);
        if bits.is_empty() {
            Entry::Zero
        } else {
            Entry::Bits(bits)
        }
    }

    /// Splits the entries of a table by their binary expansion
    #[allow(clippy::type_complexity)]
    fn split_bits(&self, table: &Table) -> (Vec<Cube>, Vec<Cube>, Vec<(Cube, Vec<bool>)>) {
        let mut zeros = Vec::new();
        let mut ones = Vec::new();
        let mut valued = Vec::new();
        for (pattern, p) in &table.entries {
            match self.classify(*p) {
                Entry::Zero => zeros.push(pattern.clone()),
                Entry::One => ones.push(pattern.clone()),
                Entry::Bits(bits) => valued.push((pattern.clone(), bits)),
            }
        }
        (zeros, ones, valued)
    }

    /// Bit `i` weighs `0.5^(i+1)`, the uniform selector picks which bit an entry reads. When
    /// the table is disabled the selector is fixed to the first bit.
    fn bit_vars(&mut self, count: usize, enabled: Option<Lit>) -> BitVars {
        let bits = (0..count)
            .map(|i| {
                self.state
                    .random_var(Weight::Prob(0.5f64.powi(i as i32 + 1)))
            })
            .collect();
        let positions = count.max(1);
        let selectors = (0..Selector::width(positions))
            .map(|_| self.state.random_var(Weight::Uniform))
            .collect();
        let selector = Selector::new(selectors, positions);
        for cube in selector.unused() {
            self.state
                .add_clause(&cube.blocking_clause(&selector.vars, None));
        }
        if let Some(e) = enabled {
            for l in selector.literals(0) {
                self.state.add_clause(&[e, l]);
            }
        }
        BitVars { bits, selector }
    }

    /// For every bit position, the entries having that bit imply it when it is selected,
    /// and the others forbid its selection. Entries of value 1 select the first bit without
    /// constraining it.
    fn encode_bit_share(&mut self, id: NodeId) -> anyhow::Result<()> {
        let table = self.chance_table(id)?;
        let width = table.vars.len();
        let (zeros, ones, valued) = self.split_bits(&table);
        let count = valued.iter().map(|(_, b)| b.len()).max().unwrap_or(0);
        let bits = self.bit_vars(count, table.enabled);
        let mut dont_care = table.dont_care.clone();
        dont_care.extend(zeros.iter().cloned());
        for i in 0..count {
            let (on, off): (Vec<_>, Vec<_>) = valued
                .iter()
                .partition(|(_, b)| b.get(i) == Some(&true));
            let on = on.into_iter().map(|(c, _)| c.clone()).collect();
            let off = off.into_iter().map(|(c, _)| c.clone()).collect();
            let select = bits.selector.literals(i);
            for cube in self.minimize(width, on, &dont_care)? {
                let condition = table.condition(&cube, &select);
                self.state
                    .add_clause(&implication(&condition, &[bits.bits[i].positive()]));
            }
            for cube in self.minimize(width, off, &dont_care)? {
                let condition = table.condition(&cube, &select);
                self.state.add_clause(&implication(&condition, &[]));
            }
        }
        let first = bits.selector.literals(0);
        for cube in self.minimize(width, ones, &dont_care)? {
            let condition = table.condition(&cube, &[]);
            for &l in &first {
                self.state.add_clause(&implication(&condition, &[l]));
            }
        }
        for cube in self.minimize(width, zeros, &table.dont_care)? {
            self.state
                .add_clause(&implication(&table.condition(&cube, &[]), &[]));
        }
        Ok(())
    }

    /// The table as two functions: from entries to the bits they have, and from entries and
    /// selections to whether the selection is forbidden. Both are minimized as sums of
    /// products, or synthesized as circuits and translated with fresh gate variables.
    fn encode_bit_function(&mut self, id: NodeId, circuit: bool) -> anyhow::Result<()> {
        let table = self.chance_table(id)?;
        let width = table.vars.len();
        let (zeros, ones, valued) = self.split_bits(&table);
        let count = valued.iter().map(|(_, b)| b.len()).max().unwrap_or(0);
        let bits = self.bit_vars(count, table.enabled);
        let selector = bits.selector.clone();
        let sel_width = selector.vars.len();

        let mut onset = Cover::new(width, count);
        for (cube, b) in &valued {
            let mut outputs = b.clone();
            outputs.resize(count, false);
            onset.push(cube.clone(), outputs);
        }
        onset.dont_care = table.dont_care.iter().chain(zeros.iter()).cloned().collect();

        let any_selection = Cube::full(sel_width);
        let mut offset = Cover::new(width + sel_width, 1);
        for cube in &zeros {
            offset.push(cube.concat(&any_selection), vec![true]);
        }
        for (cube, b) in &valued {
            for i in 0..count {
                if b.get(i) != Some(&true) {
                    offset.push(cube.concat(&selector.cube(i)), vec![true]);
                }
            }
        }
        for cube in &ones {
            for selection in selector.cover(1..count) {
                offset.push(cube.concat(&selection), vec![true]);
            }
        }
        offset.dont_care = table
            .dont_care
            .iter()
            .map(|c| c.concat(&any_selection))
            .chain(selector.unused().iter().map(|u| Cube::full(width).concat(u)))
            .collect();
        let offset_vars: Vec<Var> = table
            .vars
            .iter()
            .chain(selector.vars.iter())
            .copied()
            .collect();
        let enabled: Vec<Lit> = table.enabled.into_iter().collect();

        if circuit {
            if count > 0 {
                let aig = self.synthesizer.synthesize(&onset).with_context(|| {
                    format!("synthesizing bits with {}", self.synthesizer.name())
                })?;
                let inputs: Vec<Lit> = table.vars.iter().map(|v| v.positive()).collect();
                for (i, signal) in self.tseitin(&aig, &inputs).into_iter().enumerate() {
                    let mut condition = enabled.clone();
                    condition.extend(selector.literals(i));
                    match signal {
                        Signal::Const(false) => continue,
                        Signal::Const(true) => {}
                        Signal::Lit(g) => condition.push(g),
                    }
                    self.state
                        .add_clause(&implication(&condition, &[bits.bits[i].positive()]));
                }
            }
            let aig = self.synthesizer.synthesize(&offset).with_context(|| {
                format!("synthesizing selections with {}", self.synthesizer.name())
            })?;
            let inputs: Vec<Lit> = offset_vars.iter().map(|v| v.positive()).collect();
            for signal in self.tseitin(&aig, &inputs) {
                match signal {
                    Signal::Const(false) => {}
                    Signal::Const(true) => self.state.add_clause(&implication(&enabled, &[])),
                    Signal::Lit(g) => {
                        let mut condition = enabled.clone();
                        condition.push(g);
                        self.state.add_clause(&implication(&condition, &[]));
                    }
                }
            }
        } else {
            if count > 0 {
                let minimized = self
                    .minimizer
                    .minimize(&onset)
                    .with_context(|| format!("minimizing with {}", self.minimizer.name()))?;
                for (cube, outputs) in &minimized.rows {
                    for (i, _) in outputs.iter().enumerate().filter(|(_, o)| **o) {
                        let condition = table.condition(cube, &selector.literals(i));
                        self.state
                            .add_clause(&implication(&condition, &[bits.bits[i].positive()]));
                    }
                }
            }
            let minimized = self
                .minimizer
                .minimize(&offset)
                .with_context(|| format!("minimizing with {}", self.minimizer.name()))?;
            for cube in minimized.on_set(0) {
                let mut condition = enabled.clone();
                condition.extend(cube.literals(&offset_vars));
                self.state.add_clause(&implication(&condition, &[]));
            }
        }
        Ok(())
    }

    /// Adds the definitions of the gates of `aig` on fresh auxiliary variables
    fn tseitin(&mut self, aig: &Aig, inputs: &[Lit]) -> Vec<Signal> {
        let EncoderState {
            formula,
            var_count,
            tseitin,
            ..
        } = &mut self.state;
        aig.tseitin(
            inputs,
            || {
                let v = Var::from_index(*var_count);
                *var_count += 1;
                tseitin.push(v);
                v
            },
            formula,
        )
    }

    /// Utility tables. Without super utility, each utility is read under its selector
    /// pattern and its values are grouped like probabilities; with it, the single merged
    /// utility gets one variable per entry.
    pub(crate) fn encode_utilities(&mut self) -> anyhow::Result<()> {
        let network = self.network;
        match self.state.utility_selector.clone() {
            Some(selector) => {
                for (j, &u) in network.utilities().iter().enumerate() {
                    let table = self.utility_table(u, Some((&selector, j)))?;
                    let groups = self.value_groups(&table);
                    self.encode_value_groups(&table, groups, Target::Utility)?;
                }
            }
            None => {
                for &u in network.utilities() {
                    let table = self.utility_table(u, None)?;
                    for (pattern, v) in &table.entries {
                        let condition = table.condition(pattern, &[]);
                        if self.is_one(*v) {
                            continue;
                        } else if self.is_zero(*v) {
                            self.state.add_clause(&implication(&condition, &[]));
                        } else {
                            let var = self.state.new_var();
                            self.state.utility_weights.push((var, *v));
                            self.state.add_clause(&implication(&condition, &[var.positive()]));
                        }
                    }
                }
            }
        }
        tracing::trace!(
            utilities = network.utilities().len(),
            utility_vars = self.state.utility_weights.len(),
            "utilities"
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::encoder::{Encoder, EncoderOptions, StateEncoding, Strategy};
    use crate::minimize::MinimizerKind;
    use crate::network::{Network, NetworkKind, QueryKind};
    use crate::testing::{random_bn, two_nodes, umbrella};
    use crate::wmc::{ssat_value, weighted_count};
    use rand::{Rng, SeedableRng};

    fn count(net: Network, options: EncoderOptions) -> f64 {
        let enc = Encoder::new(options).compile(net).unwrap();
        weighted_count(&enc.formula, &enc.literal_weights())
    }

    fn with(strategy: Strategy, minimizer: MinimizerKind) -> EncoderOptions {
        EncoderOptions {
            strategy,
            minimizer,
            bit_table_threshold: 0,
            ..EncoderOptions::default()
        }
    }

    /// Probability of the evidence by summing the joint distribution
    fn brute_force(net: &Network) -> f64 {
        let domains: Vec<usize> = (0..net.nodes().len()).map(|id| net.num_states(id)).collect();
        crate::network::combinations(&domains)
            .iter()
            .filter(|a| net.evidence.iter().all(|&(id, s)| a[id] == s))
            .map(|a| {
                net.nodes()
                    .iter()
                    .map(|node| {
                        let row: usize = node
                            .parents
                            .iter()
                            .fold(0, |acc, &p| acc * net.num_states(p) + a[p]);
                        node.cpt().unwrap()[row][a[node.id]]
                    })
                    .product::<f64>()
            })
            .sum()
    }

    fn with_evidence(rng: &mut impl Rng, mut net: Network) -> Network {
        for id in 0..net.nodes().len() {
            if rng.gen_bool(0.3) {
                let s = rng.gen_range(0..net.num_states(id));
                net.add_evidence(id, s).unwrap();
            }
        }
        net
    }

    #[test]
    fn strategies_agree_on_dyadic_networks() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let strategies = [
            (Strategy::Direct, MinimizerKind::None),
            (Strategy::RowMutex, MinimizerKind::None),
            (Strategy::Minimized, MinimizerKind::None),
            (Strategy::Minimized, MinimizerKind::Qm),
            (Strategy::BitShare, MinimizerKind::None),
            (Strategy::BitShare, MinimizerKind::Qm),
            (Strategy::BitSop, MinimizerKind::Qm),
            (Strategy::BitAig, MinimizerKind::None),
            (Strategy::BitAig, MinimizerKind::Qm),
        ];
        for round in 0..6 {
            let net = random_bn(&mut rng, 4, 2, 3, true);
            let net = with_evidence(&mut rng, net);
            let expected = brute_force(&net);
            for &(strategy, minimizer) in &strategies {
                let got = count(net.clone(), with(strategy, minimizer));
                assert!(
                    (got - expected).abs() < 1e-12,
                    "round {} {} {:?}: {} != {}",
                    round,
                    strategy,
                    minimizer,
                    got,
                    expected
                );
            }
        }
    }

    #[test]
    fn direct_and_row_mutex_on_one_hot() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..4 {
            let net = random_bn(&mut rng, 4, 2, 4, false);
            let net = with_evidence(&mut rng, net);
            let expected = brute_force(&net);
            for &strategy in &[Strategy::Direct, Strategy::RowMutex] {
                let got = count(
                    net.clone(),
                    EncoderOptions {
                        strategy,
                        state_encoding: StateEncoding::OneHot,
                        ..EncoderOptions::default()
                    },
                );
                assert!((got - expected).abs() < 1e-9, "{}: {} != {}", strategy, got, expected);
            }
        }
    }

    #[test]
    fn bit_truncation_is_bounded() {
        let mut net = two_nodes();
        net.add_evidence(1, 1).unwrap();
        for &budget in &[3, 8, 20] {
            let got = count(
                net.clone(),
                EncoderOptions {
                    bit_budget: budget,
                    ..with(Strategy::BitShare, MinimizerKind::None)
                },
            );
            // four entries, each off by at most one unit of the last bit
            assert!((got - 0.5).abs() <= 2. * 0.5f64.powi(budget as i32), "{}", got);
        }
    }

    #[test]
    fn value_sharing() {
        // both rows use 0.2 and 0.8: direct shares one variable for the whole table
        let enc = Encoder::new(EncoderOptions::default())
            .compile(two_nodes())
            .unwrap();
        assert_eq!(enc.random.len(), 2);
        let enc = Encoder::new(with(Strategy::Minimized, MinimizerKind::None))
            .compile(two_nodes())
            .unwrap();
        assert_eq!(enc.random.len(), 3);
    }

    #[test]
    fn sharing_across_tables_only_under_exclusive_conditions() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        for _ in 0..4 {
            let net = random_bn(&mut rng, 5, 2, 3, true);
            let net = with_evidence(&mut rng, net);
            let expected = brute_force(&net);
            for &strategy in &[Strategy::Direct, Strategy::Minimized] {
                let options = EncoderOptions {
                    strategy,
                    share_across_tables: true,
                    ..EncoderOptions::default()
                };
                let got = count(net.clone(), options);
                assert!((got - expected).abs() < 1e-12, "{}: {} != {}", strategy, got, expected);
            }
        }
    }

    #[test]
    fn deterministic_tables_need_no_weight() {
        let mut net = Network::new(NetworkKind::Bayesian, QueryKind::Pe);
        let a = net
            .add_chance("A", &["0", "1", "2"], &[], vec![vec![0., 1., 0.]])
            .unwrap();
        net.add_chance("B", &["0", "1"], &[a], vec![vec![1., 0.]; 3])
            .unwrap();
        for &strategy in Strategy::VARIANTS {
            let options = with(strategy.parse().unwrap(), MinimizerKind::Qm);
            let enc = Encoder::new(options).compile(net.clone()).unwrap();
            let weighted = enc
                .random
                .iter()
                .filter(|(_, w)| *w != crate::encoder::Weight::Uniform)
                .count();
            assert_eq!(weighted, 0, "{}", strategy);
            let got = weighted_count(&enc.formula, &enc.literal_weights());
            assert!((got - 1.).abs() < 1e-12, "{}: {}", strategy, got);
        }
    }

    #[test]
    fn umbrella_expected_utility() -> anyhow::Result<()> {
        // leaving the umbrella is best whatever the forecast
        let expected = 0.75 * 100.;
        for &state_encoding in &[StateEncoding::OneHot, StateEncoding::Log] {
            for &super_utility in &[false, true] {
                let options = EncoderOptions {
                    state_encoding,
                    super_utility,
                    ..EncoderOptions::default()
                };
                let enc = Encoder::new(options).compile(umbrella())?;
                let prefix = crate::writer::prefix(&enc)?;
                let value = ssat_value(&enc.formula, &prefix)? * enc.scale_log2()?.exp2();
                let meu = enc.utility_scaling.unwrap().restore_sum(value);
                assert!(
                    (meu - expected).abs() < 1e-9,
                    "{:?} super utility {}: {}",
                    state_encoding,
                    super_utility,
                    meu
                );
            }
        }
        Ok(())
    }

    #[test]
    fn minimized_utilities_keep_the_value() -> anyhow::Result<()> {
        let options = EncoderOptions {
            strategy: Strategy::Minimized,
            minimizer: MinimizerKind::Qm,
            ..EncoderOptions::default()
        };
        let enc = Encoder::new(options).compile(umbrella())?;
        let prefix = crate::writer::prefix(&enc)?;
        let value = ssat_value(&enc.formula, &prefix)? * enc.scale_log2()?.exp2();
        let meu = enc.utility_scaling.unwrap().restore_sum(value);
        assert!((meu - 75.).abs() < 1e-9, "{}", meu);
        Ok(())
    }
}
