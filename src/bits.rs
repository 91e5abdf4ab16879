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

//! Binary expansion of probabilities and selector multiplexers.

use crate::cube::{merge_adjacent, Cube};
use varisat_formula::{Lit, Var};

/// Smallest `k` such that `2^k >= n`. `ceil_log2(0) == ceil_log2(1) == 0`.
///
/// # Example
/// ```
/// use pgm2ssat::bits::ceil_log2;
/// assert_eq!(ceil_log2(1), 0);
/// assert_eq!(ceil_log2(5), 3);
/// assert_eq!(ceil_log2(8), 3);
/// ```
pub fn ceil_log2(n: usize) -> usize {
    let mut k = 0;
    while (1usize << k) < n {
        k += 1;
    }
    k
}

/// Binary expansion of `p`: bit `b` has weight `0.5^(b+1)`.
///
/// At most `budget` bits are produced. Expansion stops once the residual is below half the
/// resolution `max(0.5^budget, tolerance)`, and the last bit rounds up a residual larger than
/// that. Trailing zero bits are trimmed.
pub fn binary_expansion(mut p: f64, budget: usize, tolerance: f64) -> Vec<bool> {
    let resolution = 0.5f64.powi(budget as i32).max(tolerance);
    let mut bits = Vec::with_capacity(budget);
    let mut weight = 1.;
    for b in 0..budget {
        if p < resolution / 2. {
            break;
        }
        weight /= 2.;
        let last = b + 1 == budget;
        if p >= weight || (last && p > resolution / 2.) {
            bits.push(true);
            p = (p - weight).max(0.);
        } else {
            bits.push(false);
        }
    }
    while bits.last() == Some(&false) {
        bits.pop();
    }
    bits
}

/// Value of a binary expansion
pub fn expansion_value(bits: &[bool]) -> f64 {
    let mut weight = 1.;
    let mut res = 0.;
    for &b in bits {
        weight /= 2.;
        if b {
            res += weight;
        }
    }
    res
}

/// Uniform variables choosing one of `positions` items.
///
/// Item `j` is selected by the assignment of the variables to the bits of `j`, most
/// significant first. Assignments past the last item are forbidden.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    /// selector variables, most significant first
    pub vars: Vec<Var>,
    /// number of items
    pub positions: usize,
}

impl Selector {
    /// Number of variables needed to select among `positions` items
    pub fn width(positions: usize) -> usize {
        ceil_log2(positions)
    }

    /// A selector on these variables, which must be at least `width(positions)` many.
    pub fn new(vars: Vec<Var>, positions: usize) -> Selector {
        debug_assert!(vars.len() >= ceil_log2(positions));
        Selector { vars, positions }
    }

    /// The cube selecting item `j`
    pub fn cube(&self, j: usize) -> Cube {
        Cube::from_bits(j, self.vars.len())
    }

    /// The literals selecting item `j`
    pub fn literals(&self, j: usize) -> Vec<Lit> {
        self.cube(j).literals(&self.vars)
    }

    /// Merged cubes of the assignments that select no item
    pub fn unused(&self) -> Vec<Cube> {
        let total = 1usize << self.vars.len();
        merge_adjacent(
            (self.positions..total)
                .map(|j| Cube::from_bits(j, self.vars.len()))
                .collect(),
        )
    }

    /// Merged cubes of the selections of these items
    pub fn cover(&self, items: impl IntoIterator<Item = usize>) -> Vec<Cube> {
        merge_adjacent(items.into_iter().map(|j| self.cube(j)).collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exact_expansions() {
        assert_eq!(binary_expansion(0.5, 32, 1e-16), vec![true]);
        assert_eq!(binary_expansion(0.75, 32, 1e-16), vec![true, true]);
        assert_eq!(binary_expansion(0.3125, 32, 1e-16), vec![false, true, false, true]);
        assert_eq!(binary_expansion(0., 32, 1e-16), Vec::<bool>::new());
    }

    #[test]
    fn truncated_expansion() {
        for &p in &[0.1, 0.2, 0.3333, 0.9, 0.123456789] {
            for &budget in &[4, 8, 20, 32] {
                let bits = binary_expansion(p, budget, 1e-16);
                assert!(bits.len() <= budget);
                let error = (expansion_value(&bits) - p).abs();
                assert!(
                    error <= 0.5f64.powi(budget as i32),
                    "p={} budget={} error={}",
                    p,
                    budget,
                    error
                );
            }
        }
    }

    #[test]
    fn tolerance_stops_early() {
        let bits = binary_expansion(0.1, 32, 1e-3);
        assert!(bits.len() <= 10);
        assert!((expansion_value(&bits) - 0.1).abs() <= 1e-3);
    }

    #[test]
    fn selector_cubes() {
        let vars: Vec<Var> = (0..2).map(Var::from_index).collect();
        let sel = Selector::new(vars.clone(), 3);
        assert_eq!(sel.cube(2).to_string(), "10");
        assert_eq!(sel.unused(), vec![Cube::from_bits(3, 2)]);
        assert_eq!(sel.cover(vec![0, 1]), vec!["0-".parse().unwrap()]);
        assert_eq!(sel.literals(1), vec![vars[0].negative(), vars[1].positive()]);
        let single = Selector::new(vec![], 1);
        assert!(single.unused().is_empty());
        assert_eq!(single.cube(0), Cube::full(0));
    }
}
