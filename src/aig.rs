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

//! And-inverter graphs: synthesis from covers, AIGER parsing and Tseitin translation.

use crate::minimize::{Cover, Identity, Minimizer};
use crate::utils::{run_tool, MaybePersistentTempFile};
use aiger::{Aiger, Reader};
use anyhow::Context;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use varisat_formula::{ExtendFormula, Lit, Var};

/// A possibly inverted node of an [`Aig`]: `2 * node + inverted`. Node 0 is constant false,
/// nodes `1..=inputs` are the inputs, the following ones are and gates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AigLit(pub usize);

impl AigLit {
    /// constant false
    pub const FALSE: AigLit = AigLit(0);
    /// constant true
    pub const TRUE: AigLit = AigLit(1);

    /// The node this literal refers to
    pub fn node(self) -> usize {
        self.0 >> 1
    }

    /// Whether the node is negated
    pub fn is_inverted(self) -> bool {
        self.0 & 1 == 1
    }

    /// `Some(b)` for constants
    pub fn constant(self) -> Option<bool> {
        if self.node() == 0 {
            Some(self.is_inverted())
        } else {
            None
        }
    }
}

impl std::ops::Not for AigLit {
    type Output = AigLit;
    fn not(self) -> AigLit {
        AigLit(self.0 ^ 1)
    }
}

/// A combinational and-inverter graph with structural hashing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Aig {
    inputs: usize,
    gates: Vec<(AigLit, AigLit)>,
    hash: BTreeMap<(AigLit, AigLit), AigLit>,
    /// output signals
    pub outputs: Vec<AigLit>,
}

/// Value of an [`Aig`] signal once translated to clauses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// the signal does not depend on inputs
    Const(bool),
    /// the signal is equivalent to this literal
    Lit(Lit),
}

impl Aig {
    /// A graph with these many inputs and no gate
    pub fn new(inputs: usize) -> Aig {
        Aig {
            inputs,
            ..Aig::default()
        }
    }

    /// number of inputs
    pub fn input_count(&self) -> usize {
        self.inputs
    }

    /// number of and gates
    pub fn gate_count(&self) -> usize {
        self.gates.len()
    }

    /// The `i`-th input
    pub fn input(&self, i: usize) -> AigLit {
        debug_assert!(i < self.inputs);
        AigLit(2 * (i + 1))
    }

    /// The conjunction of two signals, folding constants and reusing existing gates
    pub fn and(&mut self, a: AigLit, b: AigLit) -> AigLit {
        let (a, b) = if a <= b { (a, b) } else { (b, a) };
        if a == AigLit::FALSE || a == !b {
            return AigLit::FALSE;
        }
        if a == AigLit::TRUE || a == b {
            return b;
        }
        if let Some(&x) = self.hash.get(&(a, b)) {
            return x;
        }
        let res = AigLit(2 * (self.inputs + 1 + self.gates.len()));
        self.gates.push((a, b));
        self.hash.insert((a, b), res);
        res
    }

    /// The disjunction of two signals
    pub fn or(&mut self, a: AigLit, b: AigLit) -> AigLit {
        !self.and(!a, !b)
    }

    /// Balanced conjunction of many signals, true when empty
    pub fn and_all(&mut self, lits: &[AigLit]) -> AigLit {
        match lits.len() {
            0 => AigLit::TRUE,
            1 => lits[0],
            n => {
                let (l, r) = lits.split_at(n / 2);
                let l = self.and_all(l);
                let r = self.and_all(r);
                self.and(l, r)
            }
        }
    }

    /// Balanced disjunction of many signals, false when empty
    pub fn or_all(&mut self, lits: &[AigLit]) -> AigLit {
        let negated: Vec<AigLit> = lits.iter().map(|&l| !l).collect();
        !self.and_all(&negated)
    }

    /// Two-level graph of a cover: one conjunction per row, one disjunction per output.
    /// The don't care set is ignored.
    pub fn from_cover(cover: &Cover) -> Aig {
        let mut res = Aig::new(cover.inputs);
        let terms: Vec<AigLit> = cover
            .rows
            .iter()
            .map(|(cube, _)| {
                let lits: Vec<AigLit> = cube
                    .0
                    .iter()
                    .enumerate()
                    .filter_map(|(i, v)| v.map(|b| if b { res.input(i) } else { !res.input(i) }))
                    .collect();
                res.and_all(&lits)
            })
            .collect();
        for o in 0..cover.outputs {
            let on: Vec<AigLit> = cover
                .rows
                .iter()
                .zip(&terms)
                .filter(|((_, outs), _)| outs[o])
                .map(|(_, &t)| t)
                .collect();
            let out = res.or_all(&on);
            res.outputs.push(out);
        }
        res
    }

    /// Reads an ASCII AIGER combinational circuit
    pub fn from_aiger<R: Read>(input: R) -> anyhow::Result<Aig> {
        let reader = Reader::from_reader(input)
            .map_err(dbg_to_string)
            .context("parsing aiger header")?;
        let h = reader.header();
        anyhow::ensure!(h.l == 0, "aiger circuit has {} latches", h.l);
        let mut res = Aig::new(h.i);
        let mut variables: BTreeMap<usize, AigLit> = BTreeMap::new();
        let mut gates: BTreeMap<usize, [aiger::Literal; 2]> = BTreeMap::new();
        let mut outputs = Vec::new();
        for record in reader.records() {
            match record.map_err(dbg_to_string).context("reading aiger record")? {
                Aiger::Input(l) => {
                    anyhow::ensure!(!l.is_inverted(), "inverted aiger input {:?}", l);
                    let index = variables.len();
                    anyhow::ensure!(index < h.i, "too many aiger inputs");
                    variables.insert(l.variable(), res.input(index));
                }
                Aiger::Latch { .. } => anyhow::bail!("aiger circuit has latches"),
                Aiger::Output(l) => outputs.push(l),
                Aiger::AndGate { output, inputs } => {
                    anyhow::ensure!(!output.is_inverted(), "and gate outputs to {:?}", output);
                    gates.insert(output.variable(), inputs);
                }
                Aiger::Symbol { .. } => {}
            }
        }
        // gates may be listed in any order in the ASCII format
        let mut stack: Vec<usize> = gates.keys().copied().collect();
        while let Some(&var) = stack.last() {
            if variables.contains_key(&var) {
                stack.pop();
                continue;
            }
            let inputs = gates
                .get(&var)
                .with_context(|| format!("undefined aiger variable {}", var))?;
            let missing: Vec<usize> = inputs
                .iter()
                .map(|l| l.variable())
                .filter(|&v| v != 0 && !variables.contains_key(&v))
                .collect();
            if missing.is_empty() {
                let a = translate(&variables, inputs[0])?;
                let b = translate(&variables, inputs[1])?;
                let gate = res.and(a, b);
                variables.insert(var, gate);
                stack.pop();
            } else {
                anyhow::ensure!(
                    stack.len() <= 3 * gates.len() + 1,
                    "cyclic aiger circuit"
                );
                for v in missing {
                    anyhow::ensure!(gates.contains_key(&v), "undefined aiger variable {}", v);
                    stack.push(v);
                }
            }
        }
        for l in outputs {
            let out = translate(&variables, l)?;
            res.outputs.push(out);
        }
        Ok(res)
    }

    /// Values of the outputs on this input assignment
    pub fn evaluate(&self, assignment: &[bool]) -> Vec<bool> {
        let mut values = Vec::with_capacity(1 + self.inputs + self.gates.len());
        values.push(false);
        values.extend_from_slice(&assignment[..self.inputs]);
        let value = |values: &[bool], l: AigLit| values[l.node()] ^ l.is_inverted();
        for &(a, b) in &self.gates {
            let v = value(&values, a) && value(&values, b);
            values.push(v);
        }
        self.outputs.iter().map(|&o| value(&values, o)).collect()
    }

    /// Tseitin translation of the gates the outputs depend on. Inputs are bound to `inputs`,
    /// each translated gate gets a variable from `fresh`, and its definition is added to
    /// `formula`. Returns the value of every output.
    pub fn tseitin(
        &self,
        inputs: &[Lit],
        mut fresh: impl FnMut() -> Var,
        formula: &mut impl ExtendFormula,
    ) -> Vec<Signal> {
        debug_assert_eq!(inputs.len(), self.inputs);
        let first_gate = self.inputs + 1;
        let mut needed = vec![false; first_gate + self.gates.len()];
        let mut stack: Vec<usize> = self.outputs.iter().map(|o| o.node()).collect();
        while let Some(node) = stack.pop() {
            if needed[node] {
                continue;
            }
            needed[node] = true;
            if node >= first_gate {
                let (a, b) = self.gates[node - first_gate];
                stack.push(a.node());
                stack.push(b.node());
            }
        }
        let mut signals: Vec<Option<Signal>> = Vec::with_capacity(needed.len());
        signals.push(Some(Signal::Const(false)));
        signals.extend(inputs.iter().map(|&l| Some(Signal::Lit(l))));
        let signal = |signals: &[Option<Signal>], l: AigLit| match signals[l.node()] {
            Some(Signal::Const(b)) => Signal::Const(b ^ l.is_inverted()),
            Some(Signal::Lit(x)) => Signal::Lit(if l.is_inverted() { !x } else { x }),
            None => Signal::Const(false),
        };
        for (i, &(a, b)) in self.gates.iter().enumerate() {
            if !needed[first_gate + i] {
                signals.push(None);
                continue;
            }
            let res = match (signal(&signals, a), signal(&signals, b)) {
                (Signal::Const(false), _) | (_, Signal::Const(false)) => Signal::Const(false),
                (Signal::Const(true), x) | (x, Signal::Const(true)) => x,
                (Signal::Lit(a), Signal::Lit(b)) => {
                    let c = fresh().positive();
                    formula.add_clause(&[!a, !b, c]);
                    formula.add_clause(&[a, !c]);
                    formula.add_clause(&[b, !c]);
                    Signal::Lit(c)
                }
            };
            signals.push(Some(res));
        }
        self.outputs.iter().map(|&o| signal(&signals, o)).collect()
    }
}

/// converts AigerError to something that is good enough for anyhow
fn dbg_to_string(x: aiger::AigerError) -> anyhow::Error {
    anyhow::Error::msg(format!("{:?}", x))
}

fn translate(variables: &BTreeMap<usize, AigLit>, l: aiger::Literal) -> anyhow::Result<AigLit> {
    let base = if l.variable() == 0 {
        AigLit::FALSE
    } else {
        *variables
            .get(&l.variable())
            .with_context(|| format!("undefined aiger variable {}", l.variable()))?
    };
    Ok(if l.is_inverted() { !base } else { base })
}

/// Something that builds a multi-level circuit computing a cover
pub trait Synthesizer {
    /// name for logs
    fn name(&self) -> &'static str;

    /// A circuit agreeing with the cover outside its don't care set
    fn synthesize(&self, cover: &Cover) -> anyhow::Result<Aig>;
}

/// Minimizes the cover, then builds the two-level circuit
pub struct TwoLevel {
    /// minimizer applied first
    pub minimizer: Box<dyn Minimizer>,
}

impl Synthesizer for TwoLevel {
    fn name(&self) -> &'static str {
        "two-level"
    }

    fn synthesize(&self, cover: &Cover) -> anyhow::Result<Aig> {
        let minimized = self
            .minimizer
            .minimize(cover)
            .with_context(|| format!("minimizing with {}", self.minimizer.name()))?;
        Ok(Aig::from_cover(&minimized))
    }
}

/// Runs abc on a PLA file, then converts its binary AIGER output to ASCII with aigtoaig.
#[derive(Debug, Clone)]
pub struct Abc {
    /// path to abc
    pub abc: PathBuf,
    /// path to aigtoaig
    pub aigtoaig: PathBuf,
}

impl Synthesizer for Abc {
    fn name(&self) -> &'static str {
        "abc"
    }

    fn synthesize(&self, cover: &Cover) -> anyhow::Result<Aig> {
        if cover.inputs == 0 || cover.rows.is_empty() {
            return Ok(Aig::from_cover(cover));
        }
        let mut pla =
            MaybePersistentTempFile::new(".pla").context("creating temp file for abc input")?;
        Identity
            .minimize(cover)?
            .write_pla(std::io::BufWriter::new(pla.as_file_mut()))
            .context("writing abc input")?;
        let binary =
            MaybePersistentTempFile::new(".aig").context("creating temp file for abc output")?;
        let ascii = MaybePersistentTempFile::new(".aag")
            .context("creating temp file for aigtoaig output")?;
        let script = format!(
            "read_pla {}; strash; dc2; write_aiger {}",
            pla.as_ref().display(),
            binary.as_ref().display()
        );
        let mut cmd = std::process::Command::new(&self.abc);
        cmd.arg("-c").arg(script);
        run_tool(&mut cmd, "abc")?;
        let mut cmd = std::process::Command::new(&self.aigtoaig);
        cmd.arg(binary.as_ref()).arg(ascii.as_ref());
        run_tool(&mut cmd, "aigtoaig")?;
        let file = std::fs::File::open(ascii.as_ref())
            .with_context(|| format!("opening {}", ascii.as_ref().display()))?;
        let res = Aig::from_aiger(std::io::BufReader::new(file)).context("parsing abc output")?;
        anyhow::ensure!(
            res.input_count() == cover.inputs && res.outputs.len() == cover.outputs,
            "abc changed the interface of the circuit"
        );
        tracing::trace!(gates = res.gate_count(), "abc synthesis");
        Ok(res)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cube::Cube;
    use crate::minimize::QuineMcCluskey;
    use varisat_formula::CnfFormula;

    fn assignments(width: usize) -> Vec<Vec<bool>> {
        (0..1usize << width)
            .map(|v| (0..width).map(|i| (v >> (width - 1 - i)) & 1 == 1).collect())
            .collect()
    }

    #[test]
    fn structural_hashing() {
        let mut aig = Aig::new(2);
        let (a, b) = (aig.input(0), aig.input(1));
        let g = aig.and(a, b);
        assert_eq!(aig.and(b, a), g);
        assert_eq!(aig.and(a, !a), AigLit::FALSE);
        assert_eq!(aig.and(a, AigLit::TRUE), a);
        assert_eq!(aig.and(a, a), a);
        assert_eq!(aig.gate_count(), 1);
        assert_eq!(aig.and_all(&[]), AigLit::TRUE);
        assert_eq!(aig.or_all(&[]), AigLit::FALSE);
    }

    #[test]
    fn cover_circuit() -> anyhow::Result<()> {
        let mut cover = Cover::new(3, 2);
        for v in [1usize, 2, 3, 6].iter() {
            cover.push(Cube::from_bits(*v, 3), vec![true, *v > 2]);
        }
        let aig = TwoLevel {
            minimizer: Box::new(QuineMcCluskey),
        }
        .synthesize(&cover)?;
        for a in assignments(3) {
            let out = aig.evaluate(&a);
            assert_eq!(out, vec![cover.evaluate(&a, 0), cover.evaluate(&a, 1)]);
        }
        Ok(())
    }

    #[test]
    fn ascii_aiger() -> anyhow::Result<()> {
        // half adder with gates out of order: sum = a xor b, carry = a and b
        let text = "aag 7 2 0 2 3\n2\n4\n6\n12\n6 13 15\n12 2 4\n14 3 5\ni0 x\ni1 y\no0 s\no1 c\n";
        let aig = Aig::from_aiger(text.as_bytes())?;
        assert_eq!(aig.input_count(), 2);
        for a in assignments(2) {
            assert_eq!(aig.evaluate(&a), vec![a[0] ^ a[1], a[0] & a[1]]);
        }
        Ok(())
    }

    #[test]
    fn constant_outputs() -> anyhow::Result<()> {
        let aig = Aig::from_aiger("aag 1 1 0 2 0\n2\n0\n1\n".as_bytes())?;
        let mut formula = CnfFormula::new();
        let mut next = 5;
        let signals = aig.tseitin(
            &[Var::from_index(0).positive()],
            || {
                next += 1;
                Var::from_index(next)
            },
            &mut formula,
        );
        assert_eq!(signals, vec![Signal::Const(false), Signal::Const(true)]);
        assert_eq!(formula.len(), 0);
        Ok(())
    }

    #[test]
    fn tseitin_is_functional() -> anyhow::Result<()> {
        let mut aig = Aig::new(3);
        let (a, b, c) = (aig.input(0), aig.input(1), aig.input(2));
        let ab = aig.and(a, !b);
        let o = aig.or(ab, c);
        let unused = aig.and(b, c);
        aig.outputs = vec![o, !ab];
        let _ = unused;
        let inputs: Vec<Lit> = (0..3).map(|i| Var::from_index(i).positive()).collect();
        let mut formula = CnfFormula::new();
        let mut next = 2;
        let signals = aig.tseitin(
            &inputs,
            || {
                next += 1;
                Var::from_index(next)
            },
            &mut formula,
        );
        // the unused gate is not translated
        assert_eq!(formula.len(), 6);
        // every input assignment extends to exactly one model, with the right outputs
        for input in assignments(3) {
            let mut models = 0;
            for gates in assignments(next - 2) {
                let value = |l: Lit| {
                    let i = l.var().index();
                    let v = if i < 3 { input[i] } else { gates[i - 3] };
                    v ^ l.is_negative()
                };
                if formula.iter().all(|clause| clause.iter().any(|&l| value(l))) {
                    models += 1;
                    let expected = aig.evaluate(&input);
                    for (s, e) in signals.iter().zip(expected) {
                        match *s {
                            Signal::Lit(l) => assert_eq!(value(l), e),
                            Signal::Const(x) => assert_eq!(x, e),
                        }
                    }
                }
            }
            assert_eq!(models, 1);
        }
        Ok(())
    }

    #[test]
    #[ignore]
    fn abc() -> anyhow::Result<()> {
        let mut cover = Cover::new(3, 1);
        for v in [0usize, 1, 2, 5, 6, 7].iter() {
            cover.push(Cube::from_bits(*v, 3), vec![true]);
        }
        let aig = Abc {
            abc: "abc".into(),
            aigtoaig: "aigtoaig".into(),
        }
        .synthesize(&cover)?;
        for a in assignments(3) {
            assert_eq!(aig.evaluate(&a), vec![cover.evaluate(&a, 0)]);
        }
        Ok(())
    }
}
