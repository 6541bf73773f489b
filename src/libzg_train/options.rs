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

use zg_utils::config;

/// Everything the training platform reads from its environment, threaded
/// through construction instead of living in globals.
#[derive(Clone, Debug)]
pub struct GameOptions {
    // game
    pub komi: f32,
    pub ply_pass_enabled: usize,

    // resignation
    pub resign_thres: f64,
    pub resign_thres_lower_bound: f64,
    pub resign_thres_upper_bound: f64,
    pub resign_target_fp_rate: f64,
    pub resign_target_hist_size: usize,
    pub never_resign_prob: f32,

    // evaluation gate
    pub eval_num_games: usize,
    pub eval_thres: f32,
    pub eval_num_threads: i32,

    // self-play pacing
    pub selfplay_init_num: usize,
    pub selfplay_update_num: usize,
    pub selfplay_async: bool,

    // replay buffer geometry
    pub q_min_size: usize,
    pub q_max_size: usize,
    pub num_reader: usize,
    pub keep_prev_selfplay: bool,

    // liveness
    pub client_max_delay_sec: u64,
    pub expected_num_clients: usize,

    // client game behavior
    pub policy_distri_cutoff: usize,
    pub num_games_per_thread: i64,
    pub black_use_policy_network_only: bool,
    pub white_use_policy_network_only: bool,

    /// Rollout budget for the second engine of an evaluation match,
    /// negative to keep both sides equal.
    pub white_rollouts_per_thread: i64,

    // identification and persistence
    pub server_id: String,
    pub time_signature: String,
    pub record_dir: String,

    // pacing of the background loops, shrunk in tests
    pub poll_interval_ms: u64,
    pub wait_retry_ms: u64
}

impl Default for GameOptions {
    fn default() -> Self {
        Self {
            komi: *config::KOMI,
            ply_pass_enabled: *config::PLY_PASS_ENABLED,
            resign_thres: *config::RESIGN_THRES as f64,
            resign_thres_lower_bound: 1e-9,
            resign_thres_upper_bound: 0.50,
            resign_target_fp_rate: *config::RESIGN_TARGET_FP_RATE,
            resign_target_hist_size: *config::RESIGN_TARGET_HIST_SIZE,
            never_resign_prob: *config::NEVER_RESIGN_PROB,
            eval_num_games: *config::EVAL_NUM_GAMES,
            eval_thres: *config::EVAL_THRES,
            eval_num_threads: -1,
            selfplay_init_num: *config::SELFPLAY_INIT_NUM,
            selfplay_update_num: *config::SELFPLAY_UPDATE_NUM,
            selfplay_async: false,
            q_min_size: *config::Q_MIN_SIZE,
            q_max_size: *config::Q_MAX_SIZE,
            num_reader: *config::NUM_READER,
            keep_prev_selfplay: *config::KEEP_PREV_SELFPLAY,
            client_max_delay_sec: *config::CLIENT_MAX_DELAY_SEC,
            expected_num_clients: 8,
            policy_distri_cutoff: 20,
            num_games_per_thread: -1,
            black_use_policy_network_only: false,
            white_use_policy_network_only: false,
            white_rollouts_per_thread: -1,
            server_id: config::SERVER_ID.clone(),
            time_signature: zg_utils::time_signature(),
            record_dir: String::new(),
            poll_interval_ms: 500,
            wait_retry_ms: 30_000
        }
    }
}

impl GameOptions {
    /// A configuration with every background cadence shrunk so tests run
    /// in milliseconds.
    pub fn for_tests() -> Self {
        Self {
            poll_interval_ms: 5,
            wait_retry_ms: 10,
            client_max_delay_sec: 1,
            ..Default::default()
        }
    }
}
