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

//! Two-level logic minimization of multi-output covers.
//!
//! A [`Cover`] is a list of input cubes, each tagged with the outputs it turns on, plus a
//! don't care set shared by all outputs. Covers are exchanged with external tools in the
//! Berkeley PLA format.

use crate::cube::Cube;
use crate::utils::{run_tool, MaybePersistentTempFile};
use anyhow::Context;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

/// A multi-output sum of products
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cover {
    /// number of inputs
    pub inputs: usize,
    /// number of outputs
    pub outputs: usize,
    /// cubes and the outputs they turn on
    pub rows: Vec<(Cube, Vec<bool>)>,
    /// inputs for which no output matters
    pub dont_care: Vec<Cube>,
}

impl Cover {
    /// An empty cover
    pub fn new(inputs: usize, outputs: usize) -> Cover {
        Cover {
            inputs,
            outputs,
            rows: Vec::new(),
            dont_care: Vec::new(),
        }
    }

    /// A single output cover whose on-set is the union of `cubes`
    pub fn single_output(inputs: usize, cubes: impl IntoIterator<Item = Cube>) -> Cover {
        let mut res = Cover::new(inputs, 1);
        for c in cubes {
            res.push(c, vec![true]);
        }
        res
    }

    /// Adds a row
    pub fn push(&mut self, cube: Cube, outputs: Vec<bool>) {
        debug_assert_eq!(cube.width(), self.inputs);
        debug_assert_eq!(outputs.len(), self.outputs);
        self.rows.push((cube, outputs));
    }

    /// Cubes turning on `output`
    pub fn on_set(&self, output: usize) -> Vec<Cube> {
        self.rows
            .iter()
            .filter(|(_, o)| o[output])
            .map(|(c, _)| c.clone())
            .collect()
    }

    /// Value of `output` on this input assignment, don't cares read as false
    pub fn evaluate(&self, assignment: &[bool], output: usize) -> bool {
        self.rows
            .iter()
            .any(|(c, o)| o[output] && c.contains(assignment))
    }

    /// Whether this assignment is a don't care
    pub fn is_dont_care(&self, assignment: &[bool]) -> bool {
        self.dont_care.iter().any(|c| c.contains(assignment))
    }

    /// Total number of literals in the rows
    pub fn literal_count(&self) -> usize {
        self.rows.iter().map(|(c, _)| c.size()).sum()
    }

    /// Writes the cover in PLA format (type fd)
    pub fn write_pla(&self, mut out: impl Write) -> anyhow::Result<()> {
        writeln!(out, ".i {}", self.inputs)?;
        writeln!(out, ".o {}", self.outputs)?;
        writeln!(out, ".type fd")?;
        writeln!(out, ".p {}", self.rows.len() + self.dont_care.len())?;
        for (cube, outputs) in &self.rows {
            let outputs: String = outputs.iter().map(|&b| if b { '1' } else { '0' }).collect();
            writeln!(out, "{} {}", cube, outputs)?;
        }
        let dc = "-".repeat(self.outputs);
        for cube in &self.dont_care {
            writeln!(out, "{} {}", cube, dc)?;
        }
        writeln!(out, ".e")?;
        Ok(())
    }

    /// The cover as a PLA string
    pub fn to_pla(&self) -> String {
        let mut res = Vec::new();
        // writing to a Vec cannot fail
        let _ = self.write_pla(&mut res);
        String::from_utf8_lossy(&res).into_owned()
    }

    /// Parses a PLA. Rows whose outputs are all `-` go to the don't care set, other rows turn
    /// on the outputs marked `1`. Rows turning on nothing are dropped.
    pub fn from_pla(text: &str) -> anyhow::Result<Cover> {
        let mut inputs = None;
        let mut outputs = None;
        let mut res = Cover::default();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (_, parsed) = pla::line(line)
                .map_err(|e| anyhow::anyhow!("line {} of PLA: {:?}: {}", lineno + 1, line, e))?;
            match parsed {
                pla::Line::Directive(".i", Some(n)) => inputs = Some(n),
                pla::Line::Directive(".o", Some(n)) => outputs = Some(n),
                pla::Line::Directive(".e", _) | pla::Line::Directive(".end", _) => break,
                pla::Line::Directive(_, _) => {}
                pla::Line::Row(cube, outs) => {
                    let i = inputs.context("PLA row before .i")?;
                    let o = outputs.context("PLA row before .o")?;
                    anyhow::ensure!(
                        cube.width() == i && outs.len() == o,
                        "line {} of PLA has width {}/{}, expected {}/{}",
                        lineno + 1,
                        cube.width(),
                        outs.len(),
                        i,
                        o
                    );
                    if outs.iter().all(|&x| x == '-') {
                        res.dont_care.push(cube);
                    } else {
                        let outs: Vec<bool> = outs.iter().map(|&x| x == '1').collect();
                        if outs.iter().any(|&x| x) {
                            res.rows.push((cube, outs));
                        }
                    }
                }
            }
        }
        res.inputs = inputs.context("PLA without .i")?;
        res.outputs = outputs.context("PLA without .o")?;
        Ok(res)
    }
}

mod pla {
    use crate::cube::Cube;
    use nom::branch::alt;
    use nom::character::complete::{alphanumeric1, char, digit1, one_of, space0, space1};
    use nom::combinator::{eof, map, map_res, opt, recognize, rest};
    use nom::multi::many0;
    use nom::sequence::{preceded, tuple};
    use nom::IResult;

    pub enum Line<'a> {
        /// `.name` with its first argument when it is a number
        Directive(&'a str, Option<usize>),
        /// input cube and output characters
        Row(Cube, Vec<char>),
    }

    fn directive(input: &str) -> IResult<&str, Line<'_>> {
        map(
            tuple((
                recognize(preceded(char('.'), alphanumeric1)),
                opt(preceded(space1, map_res(digit1, |d: &str| d.parse::<usize>()))),
                rest,
            )),
            |(name, n, _)| Line::Directive(name, n),
        )(input)
    }

    fn row(input: &str) -> IResult<&str, Line<'_>> {
        map(
            tuple((
                many0(one_of("01-2")),
                space0,
                many0(one_of("01-~2")),
                space0,
                eof,
            )),
            |(cube, _, outs, _, _): (Vec<char>, _, Vec<char>, _, _)| {
                let cube = Cube(
                    cube.into_iter()
                        .map(|c| match c {
                            '0' => Some(false),
                            '1' => Some(true),
                            _ => None,
                        })
                        .collect(),
                );
                let outs = outs
                    .into_iter()
                    .map(|c| if c == '2' { '-' } else { c })
                    .collect();
                Line::Row(cube, outs)
            },
        )(input)
    }

    pub fn line(input: &str) -> IResult<&str, Line<'_>> {
        alt((directive, row))(input)
    }
}

/// Something that turns a cover into an equivalent, hopefully smaller, cover.
///
/// The result must agree with the input on every assignment outside the don't care set.
pub trait Minimizer {
    /// name for logs
    fn name(&self) -> &'static str;

    /// Minimizes the cover
    fn minimize(&self, cover: &Cover) -> anyhow::Result<Cover>;
}

/// Returns the cover unchanged, without its don't care set
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Minimizer for Identity {
    fn name(&self) -> &'static str {
        "none"
    }

    fn minimize(&self, cover: &Cover) -> anyhow::Result<Cover> {
        Ok(Cover {
            dont_care: Vec::new(),
            ..cover.clone()
        })
    }
}

/// Exact prime generation by iterated consensus, then essential primes and a greedy cover.
/// Outputs are minimized separately and the resulting cubes shared.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuineMcCluskey;

/// Maximum number of minterms the in-process minimizer accepts per output
pub const MAX_MINTERMS: usize = 1 << 20;

fn remove_covered(mut cubes: Vec<Cube>) -> Vec<Cube> {
    // larger cubes first so that they absorb the smaller ones
    cubes.sort_by_key(|c| c.size());
    cubes.dedup();
    let mut res: Vec<Cube> = Vec::with_capacity(cubes.len());
    for c in cubes {
        if !res.iter().any(|x| x.covers(&c)) {
            res.push(c);
        }
    }
    res
}

/// All the prime implicants of the union of `cubes`
pub fn prime_implicants(cubes: Vec<Cube>) -> Vec<Cube> {
    let mut primes = remove_covered(cubes);
    loop {
        let mut new = Vec::new();
        for (i, a) in primes.iter().enumerate() {
            for b in &primes[i + 1..] {
                if let Some(c) = a.consensus(b) {
                    if !primes.iter().chain(new.iter()).any(|x: &Cube| x.covers(&c)) {
                        new.push(c);
                    }
                }
            }
        }
        if new.is_empty() {
            return primes;
        }
        primes.extend(new);
        primes = remove_covered(primes);
    }
}

fn minterms(cube: &Cube, out: &mut BTreeSet<Vec<bool>>) {
    let free: Vec<usize> = (0..cube.width()).filter(|&i| cube.0[i].is_none()).collect();
    let base: Vec<bool> = cube.0.iter().map(|x| x.unwrap_or(false)).collect();
    for value in 0..(1usize << free.len()) {
        let mut m = base.clone();
        for (bit, &pos) in free.iter().enumerate() {
            m[pos] = (value >> bit) & 1 == 1;
        }
        out.insert(m);
    }
}

impl QuineMcCluskey {
    /// Minimal-ish single output cover of `on` using `dont_care`
    pub fn minimize_single(&self, on: &[Cube], dont_care: &[Cube]) -> anyhow::Result<Vec<Cube>> {
        if on.is_empty() {
            return Ok(Vec::new());
        }
        let mut on_minterms = BTreeSet::new();
        for c in on {
            let free = c.width() - c.size();
            anyhow::ensure!(
                free < 64 && (1usize << free) <= MAX_MINTERMS,
                "cover too large for quine-mccluskey"
            );
            minterms(c, &mut on_minterms);
            anyhow::ensure!(
                on_minterms.len() <= MAX_MINTERMS,
                "cover too large for quine-mccluskey"
            );
        }
        let primes = prime_implicants(on.iter().chain(dont_care.iter()).cloned().collect());
        let coverage: Vec<Vec<usize>> = on_minterms
            .iter()
            .map(|m| {
                primes
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.contains(m))
                    .map(|(i, _)| i)
                    .collect()
            })
            .collect();
        let mut chosen = BTreeSet::new();
        for covering in &coverage {
            if covering.len() == 1 {
                chosen.insert(covering[0]);
            }
        }
        let mut uncovered: Vec<usize> = (0..coverage.len())
            .filter(|&m| !coverage[m].iter().any(|p| chosen.contains(p)))
            .collect();
        while !uncovered.is_empty() {
            let mut gain: BTreeMap<usize, usize> = BTreeMap::new();
            for &m in &uncovered {
                for &p in &coverage[m] {
                    *gain.entry(p).or_insert(0) += 1;
                }
            }
            let best = gain
                .iter()
                .max_by(|(pa, ga), (pb, gb)| {
                    ga.cmp(gb)
                        .then(primes[**pb].size().cmp(&primes[**pa].size()))
                        .then(pb.cmp(pa))
                })
                .map(|(&p, _)| p)
                .context("minterm covered by no prime")?;
            chosen.insert(best);
            uncovered.retain(|&m| !coverage[m].contains(&best));
        }
        let essential: Vec<usize> = coverage
            .iter()
            .filter(|c| c.len() == 1)
            .map(|c| c[0])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let open: Vec<usize> = (0..coverage.len())
            .filter(|&m| !coverage[m].iter().any(|p| essential.contains(p)))
            .collect();
        let mut best: Vec<usize> = chosen
            .iter()
            .copied()
            .filter(|p| !essential.contains(p))
            .collect();
        let mut budget = SEARCH_BUDGET;
        exact_cover(&coverage, &open, &mut Vec::new(), &mut best, &mut budget);
        tracing::trace!(
            primes = primes.len(),
            essential = essential.len(),
            cubes = essential.len() + best.len(),
            exhaustive = budget > 0,
            "quine-mccluskey"
        );
        Ok(essential
            .into_iter()
            .chain(best)
            .map(|p| primes[p].clone())
            .collect())
    }
}

/// Maximum number of nodes of the branch and bound search for a minimum cover
const SEARCH_BUDGET: usize = 100_000;

/// Branch and bound on the minterm with the fewest covering primes. `best` must initially be
/// a cover of `open`.
fn exact_cover(
    coverage: &[Vec<usize>],
    open: &[usize],
    current: &mut Vec<usize>,
    best: &mut Vec<usize>,
    budget: &mut usize,
) {
    if *budget == 0 {
        return;
    }
    *budget -= 1;
    let remaining: Vec<usize> = open
        .iter()
        .copied()
        .filter(|&m| !coverage[m].iter().any(|p| current.contains(p)))
        .collect();
    let hardest = match remaining.iter().min_by_key(|&&m| coverage[m].len()) {
        None => {
            if current.len() < best.len() {
                *best = current.clone();
            }
            return;
        }
        Some(&m) => m,
    };
    if current.len() + 1 >= best.len() {
        return;
    }
    for &p in &coverage[hardest] {
        current.push(p);
        exact_cover(coverage, &remaining, current, best, budget);
        current.pop();
    }
}

impl Minimizer for QuineMcCluskey {
    fn name(&self) -> &'static str {
        "qm"
    }

    fn minimize(&self, cover: &Cover) -> anyhow::Result<Cover> {
        let mut shared: BTreeMap<Cube, Vec<bool>> = BTreeMap::new();
        for o in 0..cover.outputs {
            for cube in self.minimize_single(&cover.on_set(o), &cover.dont_care)? {
                shared
                    .entry(cube)
                    .or_insert_with(|| vec![false; cover.outputs])[o] = true;
            }
        }
        let mut res = Cover::new(cover.inputs, cover.outputs);
        res.rows = shared.into_iter().collect();
        Ok(res)
    }
}

/// Runs the espresso executable on a temporary PLA file
#[derive(Debug, Clone)]
pub struct Espresso {
    /// path to the executable
    pub program: PathBuf,
}

impl Minimizer for Espresso {
    fn name(&self) -> &'static str {
        "espresso"
    }

    fn minimize(&self, cover: &Cover) -> anyhow::Result<Cover> {
        if cover.inputs == 0 || cover.rows.is_empty() {
            return Identity.minimize(cover);
        }
        let mut file =
            MaybePersistentTempFile::new(".pla").context("creating temp file for espresso input")?;
        cover
            .write_pla(std::io::BufWriter::new(file.as_file_mut()))
            .context("writing espresso input")?;
        let mut cmd = std::process::Command::new(&self.program);
        cmd.arg(file.as_ref());
        let output = run_tool(&mut cmd, "espresso")?;
        let text = String::from_utf8_lossy(&output);
        let res = Cover::from_pla(&text).context("parsing espresso output")?;
        anyhow::ensure!(
            res.inputs == cover.inputs && res.outputs == cover.outputs,
            "espresso changed the width of the cover"
        );
        tracing::trace!(
            before = cover.rows.len(),
            after = res.rows.len(),
            "espresso minimization"
        );
        Ok(res)
    }
}

/// Which minimizer to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinimizerKind {
    /// [`Identity`]
    None,
    /// [`QuineMcCluskey`]
    Qm,
    /// [`Espresso`]
    Espresso,
}

impl MinimizerKind {
    /// accepted names
    pub const VARIANTS: &'static [&'static str] = &["none", "qm", "espresso"];

    /// Instantiates the minimizer. `espresso` is the executable used by [`Espresso`].
    pub fn build(self, espresso: &std::path::Path) -> Box<dyn Minimizer> {
        match self {
            MinimizerKind::None => Box::new(Identity),
            MinimizerKind::Qm => Box::new(QuineMcCluskey),
            MinimizerKind::Espresso => Box::new(Espresso {
                program: espresso.to_owned(),
            }),
        }
    }
}

impl FromStr for MinimizerKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "none" => MinimizerKind::None,
            "qm" | "quine-mccluskey" => MinimizerKind::Qm,
            "espresso" => MinimizerKind::Espresso,
            _ => anyhow::bail!("unknown minimizer {}", s),
        })
    }
}
