// Copyright 2020 Zero Go Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use rand::Rng;

use crate::base::{GameAction, NodeId, INVALID_NODE_ID};
use crate::options::PickMethod;
use crate::tree::EdgeStats;

/// A copy of one edge's statistics, detached from the tree.
#[derive(Clone, Debug, Default)]
pub struct EdgeSnapshot {
    pub prior: f32,
    pub reward: f32,
    pub num_visits: u32,
    pub child: NodeId
}

impl EdgeSnapshot {
    pub fn from_stats(stats: &EdgeStats) -> Self {
        Self {
            prior: stats.prior,
            reward: stats.reward,
            num_visits: stats.num_visits,
            child: stats.child
        }
    }

    /// Mean action value, zero while unvisited.
    pub fn q(&self) -> f32 {
        if self.num_visits > 0 {
            self.reward / self.num_visits as f32
        } else {
            0.0
        }
    }
}

/// The per-action weights produced by a search, prior to normalization.
#[derive(Clone, Debug)]
pub struct MctsPolicy<A> {
    pub entries: Vec<(A, f32)>
}

impl<A> Default for MctsPolicy<A> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<A: Copy> MctsPolicy<A> {
    /// Turn the raw scores into a probability distribution with the given
    /// temperature.
    ///
    /// # Arguments
    ///
    /// * `t` -
    ///
    pub fn normalize(&mut self, t: f32) {
        let mut total = 0.0;

        for entry in self.entries.iter_mut() {
            entry.1 = entry.1.powf(t.recip());
            total += entry.1;
        }

        if total > 0.0 {
            for entry in self.entries.iter_mut() {
                entry.1 /= total;
            }
        }
    }

    /// Sample an action proportionally to its weight.
    ///
    /// # Arguments
    ///
    /// * `rng` -
    ///
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Option<A> {
        let total = self.entries.iter().map(|&(_, w)| w).sum::<f32>();

        if total <= 0.0 {
            return None;
        }

        let threshold = total * rng.gen::<f32>();
        let mut so_far = 0.0;

        for &(action, weight) in &self.entries {
            so_far += weight;

            if so_far >= threshold {
                return Some(action);
            }
        }

        self.entries.last().map(|&(action, _)| action)
    }
}

/// Everything a finished search hands back to its caller.
#[derive(Clone, Debug)]
pub struct MctsResult<A> {
    pub best_action: A,
    pub root_value: f32,
    pub max_score: f32,
    pub best_edge: EdgeSnapshot,
    pub mcts_policy: MctsPolicy<A>,
    pub action_edge_pairs: Vec<(A, EdgeSnapshot)>,
    pub total_visits: usize,
    pub rank_method: PickMethod
}

impl<A: GameAction> MctsResult<A> {
    pub fn new(rank_method: PickMethod) -> Self {
        Self {
            best_action: A::default_value(),
            root_value: 0.0,
            max_score: f32::MIN,
            best_edge: EdgeSnapshot { child: INVALID_NODE_ID, ..Default::default() },
            mcts_policy: MctsPolicy { entries: vec! [] },
            action_edge_pairs: vec! [],
            total_visits: 0,
            rank_method: rank_method
        }
    }

    /// Rank the given edges according to the pick method, filling in the
    /// policy and the best action. With an empty edge list the defaults
    /// survive: `best_action = default_value`, zero visits.
    ///
    /// # Arguments
    ///
    /// * `pairs` -
    /// * `rng` - only consulted by `UniformRandom`
    ///
    pub fn add_actions<R: Rng>(&mut self, pairs: Vec<(A, EdgeSnapshot)>, rng: &mut R) {
        if pairs.is_empty() {
            return;
        }

        let random_index = if self.rank_method == PickMethod::UniformRandom {
            rng.gen_range(0..pairs.len())
        } else {
            0
        };

        for (index, (action, edge)) in pairs.into_iter().enumerate() {
            let score = match self.rank_method {
                PickMethod::MostVisited => edge.num_visits as f32,
                PickMethod::StrongestPrior => edge.prior,
                PickMethod::UniformRandom => 1.0
            };

            self.mcts_policy.entries.push((action, score));
            self.total_visits += edge.num_visits as usize;

            let chosen = if self.rank_method == PickMethod::UniformRandom {
                index == random_index
            } else {
                score > self.max_score
            };

            if chosen {
                self.max_score = score;
                self.best_action = action;
                self.best_edge = edge.clone();
            }

            self.action_edge_pairs.push((action, edge));
        }
    }

    /// Returns the rank of `action` under the given criterion, highest
    /// first, or `None` if the search never saw it.
    ///
    /// # Arguments
    ///
    /// * `action` -
    /// * `criterion` -
    ///
    pub fn rank_of(&self, action: A, criterion: PickMethod) -> Option<usize> {
        use ordered_float::OrderedFloat;

        let mut pairs = self.action_edge_pairs.clone();

        match criterion {
            PickMethod::MostVisited => {
                pairs.sort_by_key(|(_, edge)| std::cmp::Reverse(edge.num_visits));
            },
            PickMethod::StrongestPrior => {
                pairs.sort_by_key(|(_, edge)| std::cmp::Reverse(OrderedFloat(edge.prior)));
            },
            PickMethod::UniformRandom => {}
        }

        pairs.iter().position(|&(other, _)| other == action)
    }
}
