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

//! Quantifier prefixes of each query, and the output formats.

use crate::encoder::{Encoding, Weight};
use crate::network::QueryKind;
use anyhow::Context;
use fixedbitset::FixedBitSet;
use itertools::Itertools;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use varisat_formula::Var;

/// How a variable is quantified
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Quantifier {
    /// maximized
    Exists,
    /// randomized: true with this weight
    Random(Weight),
    /// threshold of an SDP query
    Threshold(f64),
}

/// Accumulates a prefix, each variable at its first occurrence only
struct PrefixBuilder {
    quantified: FixedBitSet,
    prefix: Vec<(Var, Quantifier)>,
}

impl PrefixBuilder {
    fn new(var_count: usize) -> Self {
        PrefixBuilder {
            quantified: FixedBitSet::with_capacity(var_count),
            prefix: Vec::with_capacity(var_count),
        }
    }

    fn push(&mut self, var: Var, q: Quantifier) {
        if !self.quantified.put(var.index()) {
            self.prefix.push((var, q));
        }
    }

    fn extend(&mut self, vars: impl IntoIterator<Item = Var>, q: Quantifier) {
        for v in vars {
            self.push(v, q);
        }
    }

    fn finish(self) -> anyhow::Result<Vec<(Var, Quantifier)>> {
        let mut missing = self.quantified.clone();
        missing.toggle_range(..);
        anyhow::ensure!(
            missing.count_ones(..) == 0,
            "variables {} are not quantified",
            missing.ones().map(|i| i + 1).format(" ")
        );
        Ok(self.prefix)
    }
}

const UNIFORM: Quantifier = Quantifier::Random(Weight::Uniform);

/// The quantifier prefix of the query of `encoding`, outermost first.
///
/// Every variable is quantified exactly once. Auxiliary variables are existential and
/// innermost since the others define them.
pub fn prefix(encoding: &Encoding) -> anyhow::Result<Vec<(Var, Quantifier)>> {
    let network = &encoding.network;
    let evidence = encoding.evidence_vars();
    let free_states = || {
        encoding
            .states
            .iter()
            .copied()
            .filter(|v| !evidence.contains(v))
    };
    let random = || encoding.random.iter().map(|&(v, w)| (v, Quantifier::Random(w)));
    let mut b = PrefixBuilder::new(encoding.var_count());
    match network.query {
        QueryKind::Pe => {
            b.extend(free_states(), UNIFORM);
            random().for_each(|(v, q)| b.push(v, q));
        }
        QueryKind::Mpe => {
            b.extend(free_states(), Quantifier::Exists);
            random().for_each(|(v, q)| b.push(v, q));
        }
        QueryKind::Map => {
            for &id in &network.map_vars {
                let states = encoding
                    .node_states(id)
                    .with_context(|| format!("MAP node {} has no state variables", id))?;
                b.extend(states.vars.iter().copied(), Quantifier::Exists);
            }
            b.extend(free_states(), UNIFORM);
            random().for_each(|(v, q)| b.push(v, q));
        }
        QueryKind::Sdp => {
            let sdp = network.sdp.as_ref().context("SDP query without decision")?;
            for &id in &sdp.unobserved {
                if let Some(states) = encoding.node_states(id) {
                    b.extend(states.vars.iter().copied(), UNIFORM);
                }
            }
            let (threshold, value) = encoding.threshold.context("no threshold variable")?;
            b.push(threshold, Quantifier::Threshold(value));
            for &id in network.order() {
                if let Some(states) = encoding.node_states(id) {
                    let vars = states.vars.iter().copied().filter(|v| !evidence.contains(v));
                    b.extend(vars, UNIFORM);
                }
            }
            random().for_each(|(v, q)| b.push(v, q));
        }
        QueryKind::Meu => {
            for level in (1..=encoding.levels.max).rev() {
                for &d in encoding.levels.at(level) {
                    if let Some(observed) = encoding.observations.get(&d) {
                        for &(v, w) in observed {
                            b.push(v, Quantifier::Random(w));
                        }
                    }
                    let states = encoding
                        .node_states(d)
                        .with_context(|| format!("decision {} has no state variables", d))?;
                    b.extend(states.vars.iter().copied(), Quantifier::Exists);
                }
            }
            b.extend(free_states(), UNIFORM);
            b.extend(encoding.utility_selector.iter().copied(), UNIFORM);
            for &(v, w) in &encoding.utility_weights {
                b.push(v, Quantifier::Random(Weight::Prob(w)));
            }
            random().for_each(|(v, q)| b.push(v, q));
        }
    }
    b.extend(evidence.iter().copied(), Quantifier::Exists);
    b.extend(encoding.tseitin.iter().copied(), Quantifier::Exists);
    b.finish()
}

/// Output grammars
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// one line per variable `id xid Q`, then clauses
    Ssat,
    /// DIMACS with `e`, `r` and `t` quantifier lines
    Sdimacs,
    /// DIMACS followed by `w id weight` lines
    Wcnf,
    /// DIMACS with a `c ind` projection line
    Cnf,
}

impl OutputFormat {
    /// Accepted names, also used as file extensions
    pub const VARIANTS: &'static [&'static str] = &["ssat", "sdimacs", "wcnf", "cnf"];

    /// The format named by the extension of `path`
    pub fn from_path(path: &Path) -> anyhow::Result<OutputFormat> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .with_context(|| format!("{} has no extension", path.display()))?;
        ext.parse()
            .with_context(|| format!("choosing output format of {}", path.display()))
    }
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "ssat" => OutputFormat::Ssat,
            "sdimacs" => OutputFormat::Sdimacs,
            "wcnf" => OutputFormat::Wcnf,
            "cnf" => OutputFormat::Cnf,
            _ => anyhow::bail!(
                "unknown output format {}, expected one of {}",
                s,
                Self::VARIANTS.join(", ")
            ),
        })
    }
}

/// Writes `encoding` in `format`.
pub fn write(encoding: &Encoding, format: OutputFormat, mut out: impl Write) -> anyhow::Result<()> {
    let _span = tracing::trace_span!("write", timing = true).entered();
    match format {
        OutputFormat::Ssat => write_ssat(encoding, &mut out),
        OutputFormat::Sdimacs => write_sdimacs(encoding, &mut out),
        OutputFormat::Wcnf => write_wcnf(encoding, &mut out),
        OutputFormat::Cnf => write_cnf(encoding, &mut out),
    }
    .with_context(|| format!("writing {:?} output", format))?;
    out.flush().context("flushing output")?;
    Ok(())
}

fn dimacs(v: Var) -> usize {
    v.index() + 1
}

fn write_clauses(encoding: &Encoding, out: &mut impl Write) -> anyhow::Result<()> {
    varisat_dimacs::write_dimacs_clauses(out, encoding.formula.iter())
        .context("writing clauses")?;
    Ok(())
}

fn write_ssat(encoding: &Encoding, out: &mut impl Write) -> anyhow::Result<()> {
    let prefix = prefix(encoding)?;
    writeln!(out, "{}", encoding.var_count())?;
    writeln!(out, "{}", encoding.formula.len())?;
    for (v, q) in prefix {
        let id = dimacs(v);
        match q {
            Quantifier::Exists => writeln!(out, "{} x{} E", id, id)?,
            Quantifier::Random(w) => writeln!(out, "{} x{} R {}", id, id, w.probability())?,
            Quantifier::Threshold(t) => writeln!(out, "{} x{} T {}", id, id, t)?,
        }
    }
    write_clauses(encoding, out)
}

fn write_sdimacs(encoding: &Encoding, out: &mut impl Write) -> anyhow::Result<()> {
    let prefix = prefix(encoding)?;
    writeln!(
        out,
        "p cnf {} {}",
        encoding.var_count(),
        encoding.formula.len()
    )?;
    for (v, q) in prefix {
        match q {
            Quantifier::Exists => writeln!(out, "e {} 0", dimacs(v))?,
            Quantifier::Random(w) => writeln!(out, "r {} {} 0", w.probability(), dimacs(v))?,
            Quantifier::Threshold(t) => writeln!(out, "t {} {} 0", t, dimacs(v))?,
        }
    }
    write_clauses(encoding, out)
}

fn ensure_pe(encoding: &Encoding, format: &str) -> anyhow::Result<()> {
    anyhow::ensure!(
        encoding.network.query == QueryKind::Pe,
        "{} output only supports PE queries, not {}",
        format,
        encoding.network.query
    );
    Ok(())
}

/// Weighted variables get `w id p`, all others `w id -1`.
fn write_wcnf(encoding: &Encoding, out: &mut impl Write) -> anyhow::Result<()> {
    ensure_pe(encoding, "weighted CNF")?;
    let mut weights = vec![None; encoding.var_count()];
    for &(v, w) in &encoding.random {
        if let Weight::Prob(p) = w {
            weights[v.index()] = Some(p);
        }
    }
    varisat_dimacs::write_dimacs(out, &encoding.formula).context("writing clauses")?;
    for (i, w) in weights.into_iter().enumerate() {
        match w {
            Some(p) => writeln!(out, "w {} {}", i + 1, p)?,
            None => writeln!(out, "w {} -1", i + 1)?,
        }
    }
    Ok(())
}

/// Counting the models projected on the randomized and free state variables gives the
/// probability of evidence scaled by `2^n`, when every weight is one half.
fn write_cnf(encoding: &Encoding, out: &mut impl Write) -> anyhow::Result<()> {
    ensure_pe(encoding, "projected CNF")?;
    for &(v, w) in &encoding.random {
        anyhow::ensure!(
            (w.probability() - 0.5).abs() < f64::EPSILON,
            "projected CNF requires weights 0.5, variable {} has weight {}",
            dimacs(v),
            w.probability()
        );
    }
    let evidence = encoding.evidence_vars();
    let projected = encoding
        .random
        .iter()
        .map(|&(v, _)| v)
        .chain(encoding.states.iter().copied().filter(|v| !evidence.contains(v)))
        .map(dimacs)
        .sorted()
        .dedup();
    writeln!(out, "c ind {} 0", projected.format(" "))?;
    varisat_dimacs::write_dimacs(out, &encoding.formula).context("writing clauses")?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encoder::{Encoder, EncoderOptions, Strategy};
    use crate::minimize::MinimizerKind;
    use crate::network::{Network, SdpQuery};
    use crate::testing::{two_nodes, umbrella};
    use varisat_dimacs::DimacsParser;

    fn compile(net: Network) -> Encoding {
        Encoder::new(EncoderOptions::default()).compile(net).unwrap()
    }

    fn output(enc: &Encoding, format: OutputFormat) -> anyhow::Result<String> {
        let mut buf = Vec::new();
        write(enc, format, &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    fn assert_complete(enc: &Encoding) {
        let prefix = prefix(enc).unwrap();
        assert_eq!(prefix.len(), enc.var_count());
        let distinct: std::collections::BTreeSet<Var> = prefix.iter().map(|&(v, _)| v).collect();
        assert_eq!(distinct.len(), enc.var_count());
    }

    #[test]
    fn every_query_quantifies_every_variable() {
        let mut net = two_nodes();
        net.add_evidence(1, 1).unwrap();
        assert_complete(&compile(net.clone()));
        net.query = QueryKind::Mpe;
        assert_complete(&compile(net.clone()));
        net.query = QueryKind::Map;
        net.map_vars = vec![0];
        assert_complete(&compile(net));
        let mut net = two_nodes();
        net.query = QueryKind::Sdp;
        net.sdp = Some(SdpQuery {
            decisions: vec![(1, 1)],
            unobserved: vec![0],
            threshold: 0.6,
        });
        assert_complete(&compile(net));
        assert_complete(&compile(umbrella()));
        let bits = Encoder::new(EncoderOptions {
            strategy: Strategy::BitAig,
            minimizer: MinimizerKind::Qm,
            bit_table_threshold: 0,
            ..EncoderOptions::default()
        })
        .compile(umbrella())
        .unwrap();
        assert_complete(&bits);
    }

    #[test]
    fn map_variables_come_first() {
        let mut net = two_nodes();
        net.query = QueryKind::Map;
        net.map_vars = vec![1];
        let enc = compile(net);
        let prefix = prefix(&enc).unwrap();
        let c = enc.node_states(1).unwrap().vars[0];
        assert_eq!(prefix[0], (c, Quantifier::Exists));
        assert_eq!(prefix[1].1, UNIFORM);
    }

    #[test]
    fn sdp_threshold_follows_unobserved() {
        let mut net = two_nodes();
        net.query = QueryKind::Sdp;
        net.sdp = Some(SdpQuery {
            decisions: vec![(1, 1)],
            unobserved: vec![0],
            threshold: 0.6,
        });
        let enc = compile(net);
        let prefix = prefix(&enc).unwrap();
        let r = enc.node_states(0).unwrap().vars[0];
        assert_eq!(prefix[0], (r, UNIFORM));
        assert_eq!(prefix[1].1, Quantifier::Threshold(0.6));
        let text = output(&enc, OutputFormat::Ssat).unwrap();
        assert!(text.contains(" T 0.6\n"), "{}", text);
    }

    #[test]
    fn ssat_layout() {
        let mut net = two_nodes();
        net.add_evidence(1, 1).unwrap();
        let enc = compile(net);
        let text = output(&enc, OutputFormat::Ssat).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], enc.var_count().to_string());
        assert_eq!(lines[1], enc.formula.len().to_string());
        let n = enc.var_count();
        for line in &lines[2..2 + n] {
            let fields: Vec<&str> = line.split(' ').collect();
            assert_eq!(fields[1], format!("x{}", fields[0]));
            assert!(fields[2] == "E" || fields[2] == "R", "{}", line);
        }
        assert_eq!(lines.len(), 2 + n + enc.formula.len());
        assert!(lines[2 + n..].iter().all(|l| l.ends_with(" 0") || *l == "0"));
    }

    #[test]
    fn sdimacs_layout() {
        let enc = compile(umbrella());
        let text = output(&enc, OutputFormat::Sdimacs).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            format!("p cnf {} {}", enc.var_count(), enc.formula.len())
        );
        let quantifiers: Vec<&str> = lines.by_ref().take(enc.var_count()).collect();
        assert!(quantifiers
            .iter()
            .all(|l| l.starts_with("e ") || l.starts_with("r ")));
        assert!(quantifiers.iter().any(|l| l.starts_with("e ")));
        assert_eq!(lines.count(), enc.formula.len());
    }

    #[test]
    fn cnf_reparses() -> anyhow::Result<()> {
        let mut net = Network::new(crate::network::NetworkKind::Bayesian, QueryKind::Pe);
        let r = net.add_chance("R", &["0", "1"], &[], vec![vec![0.5, 0.5]])?;
        net.add_chance("C", &["0", "1"], &[r], vec![vec![1., 0.], vec![0.5, 0.5]])?;
        net.add_evidence(1, 1)?;
        let enc = compile(net);
        let text = output(&enc, OutputFormat::Cnf)?;
        assert!(text.starts_with("c ind "));
        let parsed = DimacsParser::parse(text.as_bytes())?;
        assert_eq!(parsed.var_count(), enc.var_count());
        assert_eq!(
            parsed.iter().collect::<Vec<_>>(),
            enc.formula.iter().collect::<Vec<_>>()
        );
        Ok(())
    }

    #[test]
    fn cnf_rejects_other_weights() {
        let enc = compile(two_nodes());
        assert!(output(&enc, OutputFormat::Cnf).is_err());
    }

    #[test]
    fn weighted_cnf_is_pe_only() {
        let enc = compile(two_nodes());
        let text = output(&enc, OutputFormat::Wcnf).unwrap();
        let weights = text.lines().filter(|l| l.starts_with("w ")).count();
        assert_eq!(weights, enc.var_count());
        assert!(text.contains(" 0.8\n") || text.contains(" 0.2\n"), "{}", text);
        let mut net = two_nodes();
        net.query = QueryKind::Mpe;
        let enc = compile(net);
        assert!(output(&enc, OutputFormat::Wcnf).is_err());
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(
            OutputFormat::from_path(Path::new("out/net.sdimacs")).unwrap(),
            OutputFormat::Sdimacs
        );
        assert!(OutputFormat::from_path(Path::new("net")).is_err());
        assert!(OutputFormat::from_path(Path::new("net.qdimacs")).is_err());
    }
}
