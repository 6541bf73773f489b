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

use serde::{Deserialize, Serialize};

use zg_utils::config;

/// How the final move is ranked once the search is over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickMethod {
    MostVisited,
    StrongestPrior,
    UniformRandom
}

/// The selection-score part of the search configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchAlgoOptions {
    /// PUCT constant. Non-positive disables the prior term.
    pub c_puct: f32,

    /// Give every unexplored edge `Q = 0` instead of the parent mean.
    pub unexplored_q_zero: bool,

    /// Same, but only at the root.
    pub root_unexplored_q_zero: bool
}

impl Default for SearchAlgoOptions {
    fn default() -> Self {
        Self {
            c_puct: *config::C_PUCT,
            unexplored_q_zero: false,
            root_unexplored_q_zero: false
        }
    }
}

/// The full engine configuration. Two engines with equal options can share
/// work, which is why this participates in request equality.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub num_threads: usize,
    pub num_rollouts_per_thread: usize,
    pub num_rollouts_per_batch: usize,
    pub virtual_loss: f32,
    pub root_epsilon: f32,
    pub root_alpha: f32,
    pub persistent_tree: bool,
    pub pick_method: PickMethod,
    pub seed: u64,
    pub alg: SearchAlgoOptions
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            num_threads: *config::NUM_THREADS,
            num_rollouts_per_thread: *config::NUM_ROLLOUTS_PER_THREAD,
            num_rollouts_per_batch: *config::NUM_ROLLOUTS_PER_BATCH,
            virtual_loss: *config::VIRTUAL_LOSS,
            root_epsilon: *config::ROOT_EPSILON,
            root_alpha: *config::ROOT_ALPHA,
            persistent_tree: *config::PERSISTENT_TREE,
            pick_method: PickMethod::MostVisited,
            seed: 0,
            alg: SearchAlgoOptions::default()
        }
    }
}

impl SearchOptions {
    /// The configuration used for evaluation matches: no exploration
    /// noise, no optimistic unexplored Q.
    pub fn for_evaluation(&self) -> Self {
        let mut out = self.clone();

        out.root_epsilon = 0.0;
        out.root_alpha = 0.0;
        out.alg.unexplored_q_zero = false;
        out.alg.root_unexplored_q_zero = false;
        out
    }

    /// The total rollout budget of one `run`.
    pub fn total_rollouts(&self) -> usize {
        self.num_threads * self.num_rollouts_per_thread
    }
}

/// Per-move overrides that arrive with a command rather than with the
/// engine configuration. Negative values mean "no override".
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CtrlOptions {
    pub rollouts_per_thread: i64
}

impl Default for CtrlOptions {
    fn default() -> Self {
        Self { rollouts_per_thread: -1 }
    }
}

impl CtrlOptions {
    pub fn reset(&mut self) {
        self.rollouts_per_thread = -1;
    }

    /// Overlay any valid field of `other` onto `self`.
    ///
    /// # Arguments
    ///
    /// * `other` -
    ///
    pub fn append(&mut self, other: &CtrlOptions) {
        if other.rollouts_per_thread > 0 {
            self.rollouts_per_thread = other.rollouts_per_thread;
        }
    }
}
