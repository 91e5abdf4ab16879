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

//! Networks shared by tests.

use crate::network::{Network, NetworkKind, NodeId, QueryKind};
use rand::Rng;

/// R -> C, P(R=0)=0.5, P(C=1|R=0)=0.2, P(C=1|R=1)=0.8
pub fn two_nodes() -> Network {
    let mut net = Network::new(NetworkKind::Bayesian, QueryKind::Pe);
    let r = net
        .add_chance("R", &["0", "1"], &[], vec![vec![0.5, 0.5]])
        .unwrap();
    net.add_chance("C", &["0", "1"], &[r], vec![vec![0.8, 0.2], vec![0.2, 0.8]])
        .unwrap();
    net
}

/// A distribution over `k` states. When `dyadic`, every value is a multiple of 1/16.
pub fn random_row(rng: &mut impl Rng, k: usize, dyadic: bool) -> Vec<f64> {
    let mut row = vec![0.0; k];
    if dyadic {
        for _ in 0..16 {
            row[rng.gen_range(0..k)] += 1.0;
        }
        row.iter_mut().for_each(|x| *x /= 16.0);
    } else {
        for x in row.iter_mut() {
            if !rng.gen_bool(0.2) {
                *x = rng.gen_range(0.05..1.0);
            }
        }
        let sum: f64 = row.iter().sum();
        if sum == 0.0 {
            row[0] = 1.0;
        } else {
            row.iter_mut().for_each(|x| *x /= sum);
        }
    }
    row
}

/// A random bayesian network whose nodes are created in topological order.
pub fn random_bn(
    rng: &mut impl Rng,
    n: usize,
    max_parents: usize,
    max_states: usize,
    dyadic: bool,
) -> Network {
    let mut net = Network::new(NetworkKind::Bayesian, QueryKind::Pe);
    for i in 0..n {
        let k = rng.gen_range(2..=max_states);
        let count = rng.gen_range(0..=max_parents.min(i));
        let mut parents: Vec<NodeId> = rand::seq::index::sample(rng, i, count).into_vec();
        parents.sort_unstable();
        let rows: usize = parents.iter().map(|&p| net.num_states(p)).product();
        let cpt = (0..rows).map(|_| random_row(rng, k, dyadic)).collect();
        let labels: Vec<String> = (0..k).map(|s| s.to_string()).collect();
        let labels: Vec<&str> = labels.iter().map(|s| s.as_str()).collect();
        net.add_chance(&format!("X{}", i), &labels, &parents, cpt)
            .unwrap();
    }
    net
}

/// Weather W -> forecast F -> decision D, utility U(W, D), cost V(D).
pub fn umbrella() -> Network {
    let mut net = Network::new(NetworkKind::Influence, QueryKind::Meu);
    let w = net
        .add_chance("W", &["dry", "rain"], &[], vec![vec![0.75, 0.25]])
        .unwrap();
    let f = net
        .add_chance(
            "F",
            &["sun", "clouds"],
            &[w],
            vec![vec![0.75, 0.25], vec![0.25, 0.75]],
        )
        .unwrap();
    let d = net.add_decision("D", &["leave", "take"], &[f]).unwrap();
    net.add_utility("U", &[w, d], vec![100.0, 20.0, 0.0, 70.0])
        .unwrap();
    net.add_utility("V", &[d], vec![0.0, -10.0]).unwrap();
    net
}
