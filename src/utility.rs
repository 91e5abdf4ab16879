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

//! Utility tables: rescaling into [0, 1] and merging into one super utility.

use crate::network::{Network, NodeId};
use serde::Serialize;

/// Name of the node created by [`Network::merge_utilities`]
pub const SUPER_UTILITY: &str = "__super_utility";

/// Affine map from normalized utility values back to the original ones
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UtilityScaling {
    /// width of the original range
    pub scale: f64,
    /// minus the minimum of the original range
    pub shift: f64,
    /// number of rescaled utility tables
    pub count: usize,
}

impl Default for UtilityScaling {
    fn default() -> Self {
        UtilityScaling {
            scale: 1.,
            shift: 0.,
            count: 0,
        }
    }
}

impl UtilityScaling {
    /// Original value of one normalized table entry
    pub fn restore(&self, normalized: f64) -> f64 {
        normalized * self.scale - self.shift
    }

    /// Original value of a sum of one normalized entry per table, e.g. an expected utility
    pub fn restore_sum(&self, normalized: f64) -> f64 {
        normalized * self.scale - self.shift * self.count as f64
    }
}

/// Index of `values` in the list of combinations of `domains`, first variable most significant
fn combination_index(domains: &[usize], values: &[usize]) -> usize {
    domains
        .iter()
        .zip(values)
        .fold(0, |acc, (&d, &v)| acc * d + v)
}

impl Network {
    /// Rescales all active utility tables into [0, 1] with a single affine map.
    ///
    /// When every value is equal the scale is 1 and all values become 0.
    pub fn normalize_utilities(&mut self) -> UtilityScaling {
        let utilities = self.utilities().to_vec();
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &u in &utilities {
            for &v in self.node(u).utility_values().unwrap_or(&[]) {
                min = min.min(v);
                max = max.max(v);
            }
        }
        if !min.is_finite() {
            return UtilityScaling::default();
        }
        let scale = if max > min { max - min } else { 1. };
        for &u in &utilities {
            if let crate::network::NodeKind::Utility { values } = &mut self.node_mut(u).kind {
                for v in values.iter_mut() {
                    *v = (*v - min) / scale;
                }
            }
        }
        let res = UtilityScaling {
            scale,
            shift: -min,
            count: utilities.len(),
        };
        tracing::debug!(scale, shift = res.shift, count = res.count, "normalized utilities");
        res
    }

    /// Sum of two utility tables, as parents and values.
    ///
    /// Parents are those of `a` followed by those of `b` not already there. Every pair of rows
    /// that agrees on shared parents contributes one row of the result.
    pub fn merge_utility_pair(&self, a: NodeId, b: NodeId) -> anyhow::Result<(Vec<NodeId>, Vec<f64>)> {
        let (na, nb) = (self.node(a), self.node(b));
        let va = na
            .utility_values()
            .ok_or_else(|| anyhow::anyhow!("{} is not a utility", na.name))?;
        let vb = nb
            .utility_values()
            .ok_or_else(|| anyhow::anyhow!("{} is not a utility", nb.name))?;
        let mut parents = na.parents.clone();
        for &p in &nb.parents {
            if !parents.contains(&p) {
                parents.push(p);
            }
        }
        let domains: Vec<usize> = parents.iter().map(|&p| self.num_states(p)).collect();
        let position_in_union: Vec<usize> = nb
            .parents
            .iter()
            .map(|p| parents.iter().position(|x| x == p).unwrap_or(0))
            .collect();
        let mut values = vec![0.; domains.iter().product()];
        let mut filled = 0;
        for (row_a, combo_a) in self.parent_combinations(a).iter().enumerate() {
            for (row_b, combo_b) in self.parent_combinations(b).iter().enumerate() {
                let mut assignment = combo_a.clone();
                assignment.resize(parents.len(), usize::MAX);
                let consistent = combo_b.iter().zip(&position_in_union).all(|(&s, &pos)| {
                    if assignment[pos] == usize::MAX {
                        assignment[pos] = s;
                        true
                    } else {
                        assignment[pos] == s
                    }
                });
                if !consistent {
                    continue;
                }
                values[combination_index(&domains, &assignment)] = va[row_a] + vb[row_b];
                filled += 1;
            }
        }
        anyhow::ensure!(
            filled == values.len(),
            "merging {} and {} filled {} of {} rows",
            na.name,
            nb.name,
            filled,
            values.len()
        );
        Ok((parents, values))
    }

    /// Replaces the active utilities by their sum, added to the arena as a new node. Returns the
    /// remaining utility, if any.
    pub fn merge_utilities(&mut self) -> anyhow::Result<Option<NodeId>> {
        let utilities = self.utilities().to_vec();
        let (&first, rest) = match utilities.split_first() {
            None => return Ok(None),
            Some(x) => x,
        };
        if rest.is_empty() {
            return Ok(Some(first));
        }
        let mut acc = first;
        for &next in rest {
            let (parents, values) = self.merge_utility_pair(acc, next)?;
            let name = format!("{}{}", SUPER_UTILITY, next);
            acc = self.add_utility(&name, &parents, values)?;
            tracing::trace!(rows = self.node(acc).utility_values().map_or(0, |v| v.len()), "merged utility");
        }
        let merged = self.node_mut(acc);
        merged.name = SUPER_UTILITY.to_owned();
        let rows = merged.utility_values().map_or(0, |v| v.len());
        self.set_utilities(vec![acc]);
        tracing::debug!(merged = utilities.len(), rows, stats = true, "built super utility");
        Ok(Some(acc))
    }
}

#[test]
fn index_of_combinations() {
    let domains = [2, 3, 2];
    for (i, c) in crate::network::combinations(&domains).iter().enumerate() {
        assert_eq!(combination_index(&domains, c), i);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::network::{NetworkKind, QueryKind};
    use crate::testing::umbrella;

    #[test]
    fn normalization_round_trip() {
        let mut net = umbrella();
        let before: Vec<Vec<f64>> = net
            .utilities()
            .iter()
            .map(|&u| net.node(u).utility_values().unwrap().to_vec())
            .collect();
        let scaling = net.normalize_utilities();
        assert_eq!(scaling.count, 2);
        assert_eq!(scaling.scale, 110.);
        assert_eq!(scaling.shift, 10.);
        for (&u, original) in net.utilities().iter().zip(&before) {
            for (&n, &o) in net.node(u).utility_values().unwrap().iter().zip(original) {
                assert!((0. ..=1.).contains(&n));
                assert!((scaling.restore(n) - o).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn constant_utilities() {
        let mut net = Network::new(NetworkKind::Influence, QueryKind::Meu);
        let d = net.add_decision("D", &["a", "b"], &[]).unwrap();
        net.add_utility("U", &[d], vec![3., 3.]).unwrap();
        let scaling = net.normalize_utilities();
        assert_eq!(scaling.scale, 1.);
        assert_eq!(net.node(1).utility_values().unwrap(), &[0., 0.]);
        assert_eq!(scaling.restore(0.), 3.);
    }

    #[test]
    fn merge_with_shared_parent() -> anyhow::Result<()> {
        let net = umbrella();
        let (u, v) = (net.utilities()[0], net.utilities()[1]);
        let (parents, values) = net.merge_utility_pair(u, v)?;
        let w = net.id_of("W").unwrap();
        let d = net.id_of("D").unwrap();
        assert_eq!(parents, vec![w, d]);
        assert_eq!(values, vec![100., 10., 0., 60.]);
        Ok(())
    }

    #[test]
    fn merge_disjoint_parents() -> anyhow::Result<()> {
        let mut net = Network::new(NetworkKind::Influence, QueryKind::Meu);
        let a = net.add_decision("A", &["0", "1"], &[])?;
        let b = net.add_decision("B", &["0", "1", "2"], &[])?;
        net.add_utility("U", &[a], vec![1., 2.])?;
        net.add_utility("V", &[b], vec![10., 20., 30.])?;
        let merged = net.merge_utilities()?.unwrap();
        assert_eq!(net.utilities(), &[merged]);
        assert_eq!(net.node(merged).parents, vec![a, b]);
        assert_eq!(
            net.node(merged).utility_values().unwrap(),
            &[11., 21., 31., 12., 22., 32.]
        );
        assert_eq!(net.node(merged).name, SUPER_UTILITY);
        Ok(())
    }

    #[test]
    fn merge_three() -> anyhow::Result<()> {
        let mut net = umbrella();
        let d = net.id_of("D").unwrap();
        net.add_utility("Z", &[d], vec![1., 2.])?;
        let merged = net.merge_utilities()?.unwrap();
        assert_eq!(
            net.node(merged).utility_values().unwrap(),
            &[101., 12., 1., 62.]
        );
        Ok(())
    }
}
