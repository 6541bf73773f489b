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

use std::env;
use std::str::FromStr;

/// Returns the value of the environment variable `name` parsed as `T`, or
/// `default` if the variable is absent or malformed.
///
/// # Arguments
///
/// * `name` -
/// * `default` -
///
pub fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(value) => value.parse::<T>().unwrap_or(default),
        Err(_) => default
    }
}

lazy_static! {
    /// The number of MCTS worker threads per engine.
    pub static ref NUM_THREADS: usize = env_or("NUM_THREADS", 4);

    /// The number of rollouts each worker performs per `run`.
    pub static ref NUM_ROLLOUTS_PER_THREAD: usize = env_or("NUM_ROLLOUTS_PER_THREAD", 100);

    /// The number of rollouts gathered before a batched expansion.
    pub static ref NUM_ROLLOUTS_PER_BATCH: usize = env_or("NUM_ROLLOUTS_PER_BATCH", 8);

    /// The PUCT exploration constant.
    pub static ref C_PUCT: f32 = env_or("C_PUCT", 1.5);

    /// The magnitude of the virtual loss added during descent.
    pub static ref VIRTUAL_LOSS: f32 = env_or("VIRTUAL_LOSS", 1.0);

    /// The weight of the dirichlet noise mixed into the root priors.
    pub static ref ROOT_EPSILON: f32 = env_or("ROOT_EPSILON", 0.25);

    /// The concentration of the dirichlet noise mixed into the root priors.
    pub static ref ROOT_ALPHA: f32 = env_or("ROOT_ALPHA", 0.03);

    /// Whether the search tree is carried over between moves.
    pub static ref PERSISTENT_TREE: bool = env_or("PERSISTENT_TREE", true);

    /// The number of parallel games each client process runs.
    pub static ref NUM_GAMES: usize = env_or("NUM_GAMES", 16);

    /// The smallest number of samples the collector will dispatch.
    pub static ref MIN_BATCH_SIZE: usize = env_or("MIN_BATCH_SIZE", 1);

    /// The largest number of samples a single inference batch may hold.
    pub static ref BATCH_SIZE: usize = env_or("BATCH_SIZE", 16);

    /// How long (in microseconds) a game thread waits for its reply before
    /// the request is considered failed.
    pub static ref BATCH_TIMEOUT_US: u64 = env_or("BATCH_TIMEOUT_US", 10_000_000);

    /// The initial resign threshold.
    pub static ref RESIGN_THRES: f32 = env_or("RESIGN_THRES", 0.05);

    /// The tolerated false positive rate of the resign threshold calculator.
    pub static ref RESIGN_TARGET_FP_RATE: f64 = env_or("RESIGN_TARGET_FP_RATE", 0.05);

    /// The window size of the resign threshold calculator.
    pub static ref RESIGN_TARGET_HIST_SIZE: usize = env_or("RESIGN_TARGET_HIST_SIZE", 2500);

    /// The probability that a game is flagged to never resign.
    pub static ref NEVER_RESIGN_PROB: f32 = env_or("NEVER_RESIGN_PROB", 0.1);

    /// The number of games each candidate model plays against the baseline.
    pub static ref EVAL_NUM_GAMES: usize = env_or("EVAL_NUM_GAMES", 400);

    /// The aggregate win-rate a candidate must reach to be promoted.
    pub static ref EVAL_THRES: f32 = env_or("EVAL_THRES", 0.55);

    /// The number of self-play games required before the first weight update.
    pub static ref SELFPLAY_INIT_NUM: usize = env_or("SELFPLAY_INIT_NUM", 5000);

    /// The number of additional self-play games required per weight update.
    pub static ref SELFPLAY_UPDATE_NUM: usize = env_or("SELFPLAY_UPDATE_NUM", 1000);

    /// Whether the replay buffer survives a model promotion.
    pub static ref KEEP_PREV_SELFPLAY: bool = env_or("KEEP_PREV_SELFPLAY", false);

    /// The minimum number of records a replay queue needs before sampling.
    pub static ref Q_MIN_SIZE: usize = env_or("Q_MIN_SIZE", 10);

    /// The maximum number of records a replay queue retains.
    pub static ref Q_MAX_SIZE: usize = env_or("Q_MAX_SIZE", 1000);

    /// The number of replay queues.
    pub static ref NUM_READER: usize = env_or("NUM_READER", 50);

    /// How long (in seconds) a client may stay silent before it is
    /// considered dead.
    pub static ref CLIENT_MAX_DELAY_SEC: u64 = env_or("CLIENT_MAX_DELAY_SEC", 1200);

    /// The compensation given to white for moving second.
    pub static ref KOMI: f32 = env_or("KOMI", 7.5);

    /// The earliest ply at which passing becomes a legal move.
    pub static ref PLY_PASS_ENABLED: usize = env_or("PLY_PASS_ENABLED", 0);

    /// The address the server binds, and clients connect, to.
    pub static ref SERVER_ADDR: String = env_or("SERVER_ADDR", "127.0.0.1:1234".to_string());

    /// An identifier for this server included in persisted file names.
    pub static ref SERVER_ID: String = env_or("SERVER_ID", "local".to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_gives_default() {
        assert_eq!(env_or("ZG_DOES_NOT_EXIST", 42usize), 42);
    }

    #[test]
    fn malformed_gives_default() {
        env::set_var("ZG_MALFORMED", "zebra");
        assert_eq!(env_or("ZG_MALFORMED", 7usize), 7);
    }

    #[test]
    fn present_is_parsed() {
        env::set_var("ZG_PRESENT", "19");
        assert_eq!(env_or("ZG_PRESENT", 0usize), 19);
    }
}
