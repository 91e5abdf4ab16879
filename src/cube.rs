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

//! Ternary cubes over an ordered list of variables, and the adjacency merging used to build
//! short forbidding clauses.

use std::fmt;
use std::str::FromStr;
use varisat_formula::{Lit, Var};

/// A conjunction of literals over an implicit ordered list of variables: `Some(b)` requires
/// the variable to be `b`, `None` leaves it free.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cube(pub Vec<Option<bool>>);

impl Cube {
    /// The cube fixing every variable to the bits of `value`, most significant first.
    pub fn from_bits(value: usize, width: usize) -> Cube {
        Cube(
            (0..width)
                .map(|i| Some((value >> (width - 1 - i)) & 1 == 1))
                .collect(),
        )
    }

    /// The cube without any constraint
    pub fn full(width: usize) -> Cube {
        Cube(vec![None; width])
    }

    /// Number of variables, constrained or not
    pub fn width(&self) -> usize {
        self.0.len()
    }

    /// Number of constrained variables
    pub fn size(&self) -> usize {
        self.0.iter().filter(|x| x.is_some()).count()
    }

    /// Juxtaposition of two cubes over disjoint variable lists
    pub fn concat(&self, other: &Cube) -> Cube {
        let mut res = self.0.clone();
        res.extend_from_slice(&other.0);
        Cube(res)
    }

    /// Whether no assignment satisfies both cubes
    pub fn conflicts(&self, other: &Cube) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .any(|(a, b)| matches!((a, b), (Some(x), Some(y)) if x != y))
    }

    /// Whether every assignment satisfying `other` satisfies `self`
    pub fn covers(&self, other: &Cube) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .all(|(a, b)| a.is_none() || a == b)
    }

    /// The consensus of two cubes that conflict on exactly one variable: the largest cube
    /// covered by their union and straddling both.
    pub fn consensus(&self, other: &Cube) -> Option<Cube> {
        let mut conflict = false;
        let mut res = Vec::with_capacity(self.width());
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            res.push(match (a, b) {
                (Some(x), Some(y)) if x != y => {
                    if conflict {
                        return None;
                    }
                    conflict = true;
                    None
                }
                (Some(x), _) | (None, Some(x)) => Some(*x),
                (None, None) => None,
            });
        }
        if conflict {
            Some(Cube(res))
        } else {
            None
        }
    }

    /// Whether this assignment satisfies the cube
    pub fn contains(&self, assignment: &[bool]) -> bool {
        self.0
            .iter()
            .zip(assignment)
            .all(|(c, &a)| c.map_or(true, |c| c == a))
    }

    /// The literals of the cube on these variables
    pub fn literals(&self, vars: &[Var]) -> Vec<Lit> {
        debug_assert_eq!(vars.len(), self.width());
        self.0
            .iter()
            .zip(vars)
            .filter_map(|(c, &v)| c.map(|b| Lit::from_var(v, b)))
            .collect()
    }

    /// The clause excluding the cube, optionally prefixed with `guard`.
    pub fn blocking_clause(&self, vars: &[Var], guard: Option<Lit>) -> Vec<Lit> {
        guard
            .into_iter()
            .chain(self.literals(vars).into_iter().map(|l| !l))
            .collect()
    }

    /// If the two cubes constrain the same variables and differ on exactly one of them,
    /// the cube covering both.
    pub fn merge(&self, other: &Cube) -> Option<Cube> {
        if self.width() != other.width() {
            return None;
        }
        let mut diff = None;
        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            match (a, b) {
                (None, None) => {}
                (Some(x), Some(y)) if x == y => {}
                (Some(_), Some(_)) if diff.is_none() => diff = Some(i),
                _ => return None,
            }
        }
        diff.map(|i| {
            let mut res = self.clone();
            res.0[i] = None;
            res
        })
    }
}

impl fmt::Display for Cube {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for x in &self.0 {
            let c = match x {
                None => '-',
                Some(false) => '0',
                Some(true) => '1',
            };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl FromStr for Cube {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Cube> {
        s.chars()
            .map(|c| match c {
                '-' | '2' => Ok(None),
                '0' => Ok(Some(false)),
                '1' => Ok(Some(true)),
                _ => anyhow::bail!("invalid character {:?} in cube {:?}", c, s),
            })
            .collect::<anyhow::Result<Vec<_>>>()
            .map(Cube)
    }
}

/// Merges adjacent cubes pairwise until no two cubes can be merged.
///
/// The result covers exactly the same assignments as the input. Duplicates are removed.
pub fn merge_adjacent(mut cubes: Vec<Cube>) -> Vec<Cube> {
    cubes.sort();
    cubes.dedup();
    loop {
        let mut used = vec![false; cubes.len()];
        let mut next = Vec::with_capacity(cubes.len());
        let mut merged_any = false;
        for i in 0..cubes.len() {
            if used[i] {
                continue;
            }
            for j in i + 1..cubes.len() {
                if used[j] {
                    continue;
                }
                if let Some(m) = cubes[i].merge(&cubes[j]) {
                    used[i] = true;
                    used[j] = true;
                    next.push(m);
                    merged_any = true;
                    break;
                }
            }
            if !used[i] {
                next.push(cubes[i].clone());
            }
        }
        next.sort();
        next.dedup();
        cubes = next;
        if !merged_any {
            return cubes;
        }
    }
}

/// Whether some literal of `a` appears negated in `b`: no assignment satisfies both
/// conjunctions.
pub fn literals_conflict(a: &[Lit], b: &[Lit]) -> bool {
    a.iter().any(|&l| b.contains(&!l))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeSet;

    fn cube(s: &str) -> Cube {
        s.parse().unwrap()
    }

    fn covered(cubes: &[Cube], width: usize) -> BTreeSet<usize> {
        (0..1 << width)
            .filter(|&v| {
                let bits: Vec<bool> = Cube::from_bits(v, width)
                    .0
                    .iter()
                    .map(|b| b.unwrap())
                    .collect();
                cubes.iter().any(|c| c.contains(&bits))
            })
            .collect()
    }

    #[test]
    fn parse_display() {
        assert_eq!(cube("01-").0, vec![Some(false), Some(true), None]);
        assert_eq!(cube("10-1").to_string(), "10-1");
        assert!("0x1".parse::<Cube>().is_err());
    }

    #[test]
    fn bits() {
        assert_eq!(Cube::from_bits(5, 4), cube("0101"));
        assert_eq!(Cube::from_bits(0, 0), Cube(vec![]));
    }

    #[test]
    fn merge_pairs() {
        assert_eq!(cube("01").merge(&cube("00")), Some(cube("0-")));
        assert_eq!(cube("01").merge(&cube("10")), None);
        assert_eq!(cube("0-").merge(&cube("1-")), Some(cube("--")));
        assert_eq!(cube("0-").merge(&cube("10")), None);
        assert_eq!(cube("01").merge(&cube("01")), None);
    }

    #[test]
    fn unused_log_patterns() {
        // states 0..5 on 3 bits, patterns 5, 6, 7 unused
        let unused: Vec<Cube> = (5..8).map(|v| Cube::from_bits(v, 3)).collect();
        let merged = merge_adjacent(unused.clone());
        assert_eq!(merged.len(), 2);
        assert_eq!(covered(&merged, 3), covered(&unused, 3));
    }

    #[test]
    fn full_merge() {
        let all: Vec<Cube> = (0..16).map(|v| Cube::from_bits(v, 4)).collect();
        assert_eq!(merge_adjacent(all), vec![Cube::full(4)]);
    }

    #[test]
    fn merge_preserves_cover() {
        let sets: &[&[usize]] = &[&[0, 3, 5, 6], &[1, 2, 3, 7, 9, 11, 15], &[], &[4]];
        for set in sets {
            let cubes: Vec<Cube> = set.iter().map(|&v| Cube::from_bits(v, 4)).collect();
            let merged = merge_adjacent(cubes.clone());
            assert!(merged.len() <= cubes.len());
            assert_eq!(covered(&merged, 4), covered(&cubes, 4));
        }
    }

    #[test]
    fn consensus_and_cover() {
        assert_eq!(cube("0-1").consensus(&cube("11-")), Some(cube("-11")));
        assert_eq!(cube("01").consensus(&cube("10")), None);
        assert_eq!(cube("01").consensus(&cube("0-")), None);
        assert!(cube("-1").covers(&cube("01")));
        assert!(!cube("01").covers(&cube("-1")));
        assert!(cube("1-0").conflicts(&cube("0--")));
    }

    #[test]
    fn clauses() {
        let vars: Vec<Var> = (0..3).map(Var::from_index).collect();
        let c = cube("1-0");
        let lits = c.literals(&vars);
        assert_eq!(lits, vec![vars[0].positive(), vars[2].negative()]);
        let guard = Var::from_index(7).negative();
        assert_eq!(
            c.blocking_clause(&vars, Some(guard)),
            vec![guard, vars[0].negative(), vars[2].positive()]
        );
        assert!(literals_conflict(&lits, &[vars[2].positive()]));
        assert!(!literals_conflict(&lits, &[vars[1].positive()]));
    }
}
