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

//! Exhaustive evaluation of small formulas: weighted model counting, satisfiability and the
//! value of stochastic SAT prefixes.
//!
//! The search branches on variables of unsatisfied clauses only, and propagates unit clauses.
//! Variables which no unsatisfied clause mentions are summed out in closed form. This is
//! exponential, only meant to check encodings of small networks.

use crate::encoder::Weight;
use crate::writer::Quantifier;
use varisat_formula::{CnfFormula, Lit, Var};

/// Partial assignment with per clause counters
struct Search<'a> {
    clauses: Vec<&'a [Lit]>,
    /// clauses mentioning each variable, once per clause
    occurs: Vec<Vec<usize>>,
    value: Vec<Option<bool>>,
    /// number of true literals of each clause
    sat: Vec<usize>,
    /// number of unassigned literals of each clause
    free: Vec<usize>,
    /// clauses without true literal
    open: usize,
    /// clauses without true or unassigned literal
    conflicts: usize,
    trail: Vec<Var>,
}

impl<'a> Search<'a> {
    fn new(formula: &'a CnfFormula) -> Self {
        let clauses: Vec<&[Lit]> = formula.iter().collect();
        let mut occurs = vec![Vec::new(); formula.var_count()];
        for (i, c) in clauses.iter().enumerate() {
            for l in c.iter() {
                let o: &mut Vec<usize> = &mut occurs[l.index()];
                if o.last() != Some(&i) {
                    o.push(i);
                }
            }
        }
        Search {
            sat: vec![0; clauses.len()],
            free: clauses.iter().map(|c| c.len()).collect(),
            open: clauses.len(),
            conflicts: clauses.iter().filter(|c| c.is_empty()).count(),
            value: vec![None; formula.var_count()],
            occurs,
            clauses,
            trail: Vec::new(),
        }
    }

    fn lit_value(&self, l: Lit) -> Option<bool> {
        self.value[l.index()].map(|v| v == l.is_positive())
    }

    /// Assigns `l`, returns false on conflict.
    fn assign(&mut self, l: Lit) -> bool {
        let var = l.var();
        self.value[var.index()] = Some(l.is_positive());
        self.trail.push(var);
        for &c in &self.occurs[var.index()] {
            for &m in self.clauses[c] {
                if m.var() != var {
                    continue;
                }
                self.free[c] -= 1;
                if m == l {
                    if self.sat[c] == 0 {
                        self.open -= 1;
                    }
                    self.sat[c] += 1;
                }
            }
            if self.sat[c] == 0 && self.free[c] == 0 {
                self.conflicts += 1;
            }
        }
        self.conflicts == 0
    }

    fn undo_to(&mut self, len: usize) {
        while self.trail.len() > len {
            let var = match self.trail.pop() {
                Some(v) => v,
                None => break,
            };
            let positive = self.value[var.index()] == Some(true);
            for &c in &self.occurs[var.index()] {
                if self.sat[c] == 0 && self.free[c] == 0 {
                    self.conflicts -= 1;
                }
                for &m in self.clauses[c] {
                    if m.var() != var {
                        continue;
                    }
                    self.free[c] += 1;
                    if m.is_positive() == positive {
                        self.sat[c] -= 1;
                        if self.sat[c] == 0 {
                            self.open += 1;
                        }
                    }
                }
            }
            self.value[var.index()] = None;
        }
    }

    /// Assigns the literals of unit clauses until fixpoint. Returns the product of their
    /// weights according to `weight`, or None on conflict.
    fn propagate(&mut self, weight: impl Fn(Lit) -> f64) -> Option<f64> {
        let mut factor = 1.;
        if self.conflicts > 0 {
            return None;
        }
        loop {
            let unit = (0..self.clauses.len())
                .find(|&c| self.sat[c] == 0 && self.free[c] == 1)
                .and_then(|c| {
                    self.clauses[c]
                        .iter()
                        .copied()
                        .find(|&l| self.lit_value(l).is_none())
                });
            match unit {
                None => return Some(factor),
                Some(l) => {
                    factor *= weight(l);
                    if !self.assign(l) {
                        return None;
                    }
                }
            }
        }
    }

    /// Some variable of a shortest unsatisfied clause
    fn branching_var(&self) -> Option<Var> {
        (0..self.clauses.len())
            .filter(|&c| self.sat[c] == 0)
            .min_by_key(|&c| self.free[c])
            .and_then(|c| {
                self.clauses[c]
                    .iter()
                    .find(|l| self.lit_value(**l).is_none())
                    .map(|l| l.var())
            })
    }

    /// Whether some unsatisfied clause mentions `var`
    fn constrains(&self, var: Var) -> bool {
        self.occurs[var.index()].iter().any(|&c| self.sat[c] == 0)
    }

    fn count(&mut self, weights: &[(f64, f64)]) -> f64 {
        let weight = |l: Lit| {
            let (pos, neg) = weights[l.index()];
            if l.is_positive() {
                pos
            } else {
                neg
            }
        };
        let mark = self.trail.len();
        let res = match self.propagate(weight) {
            None => 0.,
            Some(factor) if self.open == 0 => {
                let rest: f64 = (0..self.value.len())
                    .filter(|&i| self.value[i].is_none())
                    .map(|i| weights[i].0 + weights[i].1)
                    .product();
                factor * rest
            }
            Some(factor) => match self.branching_var() {
                None => 0.,
                Some(var) => {
                    let mut sum = 0.;
                    for &l in &[var.positive(), var.negative()] {
                        let w = weight(l);
                        if w == 0. {
                            continue;
                        }
                        let before = self.trail.len();
                        if self.assign(l) {
                            sum += w * self.count(weights);
                        }
                        self.undo_to(before);
                    }
                    factor * sum
                }
            },
        };
        self.undo_to(mark);
        res
    }

    fn satisfiable(&mut self) -> bool {
        let mark = self.trail.len();
        let res = match self.propagate(|_| 1.) {
            None => false,
            Some(_) if self.open == 0 => true,
            Some(_) => match self.branching_var() {
                None => false,
                Some(var) => [var.positive(), var.negative()].iter().any(|&l| {
                    let before = self.trail.len();
                    let res = self.assign(l) && self.satisfiable();
                    self.undo_to(before);
                    res
                }),
            },
        };
        self.undo_to(mark);
        res
    }

    /// Value of the prefix from position `next` on. Propagating a unit literal of a
    /// randomized variable weighs it, of an existential one is free.
    fn ssat(&mut self, prefix: &[(Var, Quantifier)], quantifiers: &[Option<Quantifier>], next: usize) -> f64 {
        let weight = |l: Lit| match quantifiers[l.index()] {
            Some(Quantifier::Random(w)) => {
                let p = w.probability();
                if l.is_positive() {
                    p
                } else {
                    1. - p
                }
            }
            _ => 1.,
        };
        let mark = self.trail.len();
        let res = match self.propagate(weight) {
            None => 0.,
            Some(factor) if self.open == 0 => factor,
            Some(factor) => {
                let position = (next..prefix.len()).find(|&i| {
                    let var = prefix[i].0;
                    self.value[var.index()].is_none() && self.constrains(var)
                });
                match position {
                    None => 0.,
                    Some(i) => {
                        let (var, q) = prefix[i];
                        let branch = |search: &mut Self, l: Lit| {
                            let before = search.trail.len();
                            let res = if search.assign(l) {
                                search.ssat(prefix, quantifiers, i + 1)
                            } else {
                                0.
                            };
                            search.undo_to(before);
                            res
                        };
                        let value = match q {
                            Quantifier::Random(w) => {
                                let p = w.probability();
                                p * branch(self, var.positive())
                                    + (1. - p) * branch(self, var.negative())
                            }
                            _ => {
                                let first = branch(self, var.positive());
                                if first >= 1. {
                                    first
                                } else {
                                    first.max(branch(self, var.negative()))
                                }
                            }
                        };
                        factor * value
                    }
                }
            }
        };
        self.undo_to(mark);
        res
    }
}

/// Sum over models of the product of the weights `(positive, negative)` of their literals.
pub fn weighted_count(formula: &CnfFormula, weights: &[(f64, f64)]) -> f64 {
    Search::new(formula).count(weights)
}

/// Whether `formula` has a model extending `assumptions`
pub fn satisfiable(formula: &CnfFormula, assumptions: &[Lit]) -> bool {
    let mut search = Search::new(formula);
    assumptions.iter().all(|&l| match search.lit_value(l) {
        Some(v) => v,
        None => search.assign(l),
    }) && search.satisfiable()
}

/// Value of `formula` under the quantifier `prefix`: existential variables maximize, randomized
/// ones average with their weight. Threshold quantifiers are not supported.
pub fn ssat_value(formula: &CnfFormula, prefix: &[(Var, Quantifier)]) -> anyhow::Result<f64> {
    let mut quantifiers = vec![None; formula.var_count()];
    for &(v, q) in prefix {
        anyhow::ensure!(v.index() < quantifiers.len(), "variable {} out of range", v);
        anyhow::ensure!(
            !matches!(q, Quantifier::Threshold(_)),
            "cannot evaluate threshold quantifier of {}",
            v
        );
        anyhow::ensure!(
            quantifiers[v.index()].replace(q).is_none(),
            "variable {} quantified twice",
            v
        );
    }
    anyhow::ensure!(
        quantifiers.iter().all(Option::is_some),
        "some variables are not quantified"
    );
    Ok(Search::new(formula).ssat(prefix, &quantifiers, 0))
}

#[cfg(test)]
mod test {
    use super::*;
    use varisat_formula::ExtendFormula;

    fn parse(text: &str) -> CnfFormula {
        varisat_dimacs::DimacsParser::parse(text.as_bytes()).unwrap()
    }

    fn uniform_prefix(formula: &CnfFormula) -> Vec<(Var, Quantifier)> {
        (0..formula.var_count())
            .map(|i| (Var::from_index(i), Quantifier::Random(Weight::Uniform)))
            .collect()
    }

    #[test]
    fn counts_models() {
        let f = parse("1 2 0\n-1 -2 0\n");
        assert_eq!(weighted_count(&f, &[(1., 1.); 2]), 2.);
        let count = weighted_count(&f, &[(0.3, 0.7), (0.5, 0.5)]);
        assert!((count - 0.5).abs() < 1e-15, "{}", count);
        let mut g = f.clone();
        g.set_var_count(5);
        assert_eq!(weighted_count(&g, &[(1., 1.); 5]), 16.);
    }

    #[test]
    fn empty_clause() {
        let mut f = parse("1 2 0\n");
        f.add_clause(&[]);
        assert_eq!(weighted_count(&f, &[(1., 1.); 2]), 0.);
        assert!(!satisfiable(&f, &[]));
    }

    #[test]
    fn satisfiability_under_assumptions() {
        let f = parse("-1 2 0\n-2 3 0\n");
        assert!(satisfiable(&f, &[Lit::from_dimacs(1)]));
        assert!(!satisfiable(&f, &[Lit::from_dimacs(1), Lit::from_dimacs(-3)]));
        assert!(!satisfiable(&f, &[Lit::from_dimacs(1), Lit::from_dimacs(-1)]));
    }

    #[test]
    fn random_and_exists() -> anyhow::Result<()> {
        // x2 <-> x1
        let f = parse("-1 2 0\n1 -2 0\n");
        let x1 = Var::from_dimacs(1);
        let x2 = Var::from_dimacs(2);
        let random = Quantifier::Random(Weight::Prob(0.3));
        // choosing after seeing x1 always wins
        assert_eq!(ssat_value(&f, &[(x1, random), (x2, Quantifier::Exists)])?, 1.);
        // choosing first only wins when x1 agrees
        assert_eq!(ssat_value(&f, &[(x2, Quantifier::Exists), (x1, random)])?, 0.7);
        assert_eq!(ssat_value(&f, &uniform_prefix(&f))?, 0.5);
        assert!(ssat_value(&f, &[(x1, random)]).is_err());
        assert!(ssat_value(&f, &[(x1, random), (x2, Quantifier::Threshold(0.5))]).is_err());
        Ok(())
    }
}
