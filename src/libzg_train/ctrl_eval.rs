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

use std::collections::HashMap;
use std::sync::Mutex;

use crate::client_manager::{ClientInfo, ClientManager};
use crate::fair_pick::Pick;
use crate::options::GameOptions;
use crate::record::{FeedResult, ModelPair, Record, Request};
use crate::record_io::RecordBuffer;

/// Where one candidate stands in its gauntlet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvalResult {
    Incomplete,
    BlackPass,
    BlackNotPass
}

/// The running evaluation of one candidate against the baseline: one pick
/// with the candidate as black, one with the sides swapped. Each pick
/// receives half of `eval_num_games` plus a small cushion against stuck
/// workers.
struct ModelPerf {
    pair: ModelPair,
    games: Pick,
    swap_games: Pick,
    records: RecordBuffer,
    sent: usize,
    recv: usize,
    sealed: bool,
    result: EvalResult
}

impl ModelPerf {
    fn new(options: &GameOptions, num_eval_machines: usize, pair: ModelPair) -> Self {
        const CUSHION: usize = 5;

        let num_request = options.eval_num_games / 2 + CUSHION;
        let per_layer = compute_num_eval_machines(num_request, num_eval_machines / 2);
        let prefix = format!(
            "eval-{}-{}-{}-{}",
            options.server_id, options.time_signature, pair.black_ver, pair.white_ver
        );

        Self {
            pair: pair,
            games: Pick::new(num_request, per_layer),
            swap_games: Pick::new(num_request, per_layer),
            records: RecordBuffer::new(&options.record_dir, &prefix),
            sent: 0,
            recv: 0,
            sealed: false,
            result: EvalResult::Incomplete
        }
    }

    fn n_done(&self) -> usize {
        self.games.win_count().n_done() + self.swap_games.win_count().n_done()
    }

    fn n_win(&self) -> usize {
        self.games.win_count().n_win() + self.swap_games.win_count().n_win()
    }

    fn winrate(&self) -> f32 {
        let n = self.n_done();

        if n == 0 { 0.0 } else { self.n_win() as f32 / n as f32 }
    }

    /// Sweep both picks for dead clients, then seal if the verdict is in.
    fn update_state(&mut self, options: &GameOptions, mgr: &ClientManager) -> EvalResult {
        if self.sealed {
            return self.result;
        }

        self.games.check_stuck(mgr);
        self.swap_games.check_stuck(mgr);
        self.result = self.eval_check(options);

        if self.result != EvalResult::Incomplete {
            self.set_sealed();
        }
        self.result
    }

    fn feed(&mut self, identity: &str, record: &Record) {
        let reward = record.result.reward;

        if record.request.player_swap {
            // swapped sides, a black win is a loss for the candidate
            self.swap_games.add(identity, -reward);
        } else {
            self.games.add(identity, reward);
        }

        self.records.feed(record.clone());
        self.recv += 1;
    }

    /// Try to reserve an evaluation game for this client, preferring the
    /// side that is further behind. A starved swap side never blocks the
    /// other one.
    fn fill_in_request(&mut self, client: &ClientInfo, request: &mut Request) {
        if self.sealed {
            return;
        }

        let mut sides = [(false, self.games.n_reg_to_go()), (true, self.swap_games.n_reg_to_go())];

        if sides[0].1 < sides[1].1 {
            sides.swap(0, 1);
        }

        for &(swapped, _) in &sides {
            let pick = if swapped { &mut self.swap_games } else { &mut self.games };
            let reg = pick.reg(&client.identity);

            if !reg.need_request() {
                continue;
            }

            request.vers = self.pair.clone();
            request.player_swap = swapped;
            break;
        }

        self.sent += 1;
    }

    fn eval_check(&self, options: &GameOptions) -> EvalResult {
        let half_complete = options.eval_num_games / 2;

        if self.games.win_count().n_done() >= half_complete
            && self.swap_games.win_count().n_done() >= half_complete
        {
            if self.winrate() >= options.eval_thres {
                EvalResult::BlackPass
            } else {
                EvalResult::BlackNotPass
            }
        } else {
            EvalResult::Incomplete
        }
    }

    fn set_sealed(&mut self) {
        self.sealed = true;
        info!(
            "sealed evaluation of {}: pass={}, wr {:.3} over {} games (sent {}, recv {})",
            self.pair,
            self.result == EvalResult::BlackPass,
            self.winrate(),
            self.n_done(),
            self.sent,
            self.recv
        );
        self.records.save_current();
        self.records.clear();
    }
}

/// Spread `n` requests over layers of at most `max_per_layer` machines.
fn compute_num_eval_machines(n: usize, max_per_layer: usize) -> usize {
    if max_per_layer == 0 {
        return 1;
    }

    let min_pass = (n + max_per_layer - 1) / max_per_layer;
    let num_eval = (n + min_pass - 1) / min_pass;

    zg_utils::min(num_eval, max_per_layer)
}

struct Inner {
    best_baseline_model: i64,
    models_to_eval: Vec<i64>,
    perfs: HashMap<(i64, i64), ModelPerf>
}

/// The server-side evaluation gate: keeps the incumbent baseline, runs
/// each candidate through swap and no-swap gauntlets, and reports the
/// first candidate that clears the bar.
pub struct EvalSubCtrl {
    options: GameOptions,
    mcts_opt: zg_mcts::options::SearchOptions,
    inner: Mutex<Inner>
}

impl EvalSubCtrl {
    pub fn new(options: GameOptions, mcts_opt: zg_mcts::options::SearchOptions) -> Self {
        // evaluation matches play without exploration noise
        let mcts_opt = mcts_opt.for_evaluation();

        Self {
            options: options,
            mcts_opt: mcts_opt,
            inner: Mutex::new(Inner {
                best_baseline_model: -1,
                models_to_eval: vec! [],
                perfs: HashMap::new()
            })
        }
    }

    pub fn best_model(&self) -> i64 {
        self.inner.lock().expect("could not acquire eval lock").best_baseline_model
    }

    /// Promote `ver` to be the baseline and drop every pending candidate.
    ///
    /// # Arguments
    ///
    /// * `ver` -
    ///
    pub fn set_baseline_model(&self, ver: i64) {
        let mut inner = self.inner.lock().expect("could not acquire eval lock");

        inner.best_baseline_model = ver;
        inner.models_to_eval.clear();
        info!("new baseline model: {}", ver);
    }

    /// Queue `new_version` for evaluation against the baseline, provided
    /// the caller's view of the world is current.
    ///
    /// # Arguments
    ///
    /// * `selfplay_ver` -
    /// * `new_version` -
    ///
    pub fn add_new_model_for_evaluation(&self, selfplay_ver: i64, new_version: i64) {
        let mut inner = self.inner.lock().expect("could not acquire eval lock");

        if selfplay_ver != inner.best_baseline_model {
            warn!(
                "not evaluating {}: selfplay version {} is not the baseline {}",
                new_version, selfplay_ver, inner.best_baseline_model
            );
            return;
        }
        if new_version <= selfplay_ver {
            warn!("not evaluating {}: not newer than {}", new_version, selfplay_ver);
            return;
        }

        if !inner.models_to_eval.contains(&new_version) {
            info!("candidate model {} queued against baseline {}", new_version, selfplay_ver);
            inner.models_to_eval.push(new_version);
        }
    }

    /// Sweep every candidate's state. Returns the version of the first
    /// candidate that passed, or `-1`. A failing candidate is dropped.
    ///
    /// # Arguments
    ///
    /// * `mgr` -
    ///
    pub fn update_state(&self, mgr: &ClientManager) -> i64 {
        let mut inner = self.inner.lock().expect("could not acquire eval lock");
        let candidates = inner.models_to_eval.clone();
        let num_eval_machines = zg_utils::max(mgr.expected_num_eval(), 1);

        for ver in candidates {
            let key = self.key_for(&inner, ver);
            let result = {
                let options = &self.options;
                let perf = inner_find_or_create(
                    &mut inner.perfs, options, &self.mcts_opt, num_eval_machines, key
                );

                perf.update_state(options, mgr)
            };

            match result {
                EvalResult::Incomplete => {},
                EvalResult::BlackPass => {
                    return ver;
                },
                EvalResult::BlackNotPass => {
                    inner.models_to_eval.retain(|&other| other != ver);
                }
            }
        }
        -1
    }

    /// Ingest one evaluation record from the given client.
    ///
    /// # Arguments
    ///
    /// * `identity` -
    /// * `record` -
    ///
    pub fn feed(&self, identity: &str, record: &Record) -> FeedResult {
        if record.request.vers.is_selfplay() || record.request.vers.wait() {
            return FeedResult::NotEval;
        }

        let mut inner = self.inner.lock().expect("could not acquire eval lock");
        let key = (record.request.vers.black_ver, record.request.vers.white_ver);

        match inner.perfs.get_mut(&key) {
            None => {
                debug!("record for unscheduled pair {:?} dropped", key);
                FeedResult::NotRequested
            },
            Some(perf) => {
                perf.feed(identity, record);
                FeedResult::Feeded
            }
        }
    }

    /// Try to turn `request` into an evaluation work order for `client`.
    /// Leaves the request as a wait order when there is nothing to hand
    /// out.
    ///
    /// # Arguments
    ///
    /// * `mgr` -
    /// * `client` -
    /// * `request` -
    ///
    pub fn fill_in_request(&self, mgr: &ClientManager, client: &ClientInfo, request: &mut Request) {
        let mut inner = self.inner.lock().expect("could not acquire eval lock");
        let candidates = inner.models_to_eval.clone();
        let num_eval_machines = zg_utils::max(mgr.expected_num_eval(), 1);

        for ver in candidates {
            let key = self.key_for(&inner, ver);
            let options = &self.options;
            let mcts_opt = &self.mcts_opt;
            let perf = inner_find_or_create(
                &mut inner.perfs, options, mcts_opt, num_eval_machines, key
            );

            perf.fill_in_request(client, request);

            if !request.vers.wait() {
                request.resign_thres = self.options.resign_thres as f32;
                request.never_resign_prob = 0.0;
                request.num_game_thread_used = self.options.eval_num_threads;
                break;
            }
        }
    }

    fn key_for(&self, inner: &Inner, ver: i64) -> (i64, i64) {
        (ver, inner.best_baseline_model)
    }
}

fn inner_find_or_create<'a>(
    perfs: &'a mut HashMap<(i64, i64), ModelPerf>,
    options: &GameOptions,
    mcts_opt: &zg_mcts::options::SearchOptions,
    num_eval_machines: usize,
    key: (i64, i64)
) -> &'a mut ModelPerf {
    perfs.entry(key).or_insert_with(|| {
        let pair = ModelPair {
            black_ver: key.0,
            white_ver: key.1,
            mcts_opt: mcts_opt.clone()
        };

        ModelPerf::new(options, num_eval_machines, pair)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_manager::tests::manual_timer;
    use crate::record::{GameResult, ThreadState};

    fn options() -> GameOptions {
        GameOptions {
            eval_num_games: 4,
            eval_thres: 0.55,
            ..GameOptions::for_tests()
        }
    }

    fn manager() -> ClientManager {
        let (_, timer) = manual_timer();

        ClientManager::new(100, 0.0, timer)
    }

    fn eval_record(thread_id: usize, black: i64, white: i64, swap: bool, reward: f32) -> Record {
        Record {
            timestamp: 0,
            thread_id: thread_id,
            seq: 0,
            request: Request {
                vers: ModelPair { black_ver: black, white_ver: white, ..Default::default() },
                player_swap: swap,
                ..Default::default()
            },
            result: GameResult { reward: reward, ..Default::default() }
        }
    }

    /// Drive one client per game through request and result. The side
    /// handed out alternates because the controller always serves the
    /// side that is further behind.
    fn play_gauntlet(
        ctrl: &EvalSubCtrl,
        mgr: &ClientManager,
        rewards: &[(bool, f32)]
    ) {
        // register every client up front so the pick layers are sized
        // for the whole fleet
        for index in 0..rewards.len() {
            mgr.update_states(&format!("{}", index), &[ThreadState::default()]);
        }

        for (index, &(swap, reward)) in rewards.iter().enumerate() {
            let identity = format!("{}", index);
            let client = mgr.get_client(&identity);
            let mut request = Request::wait();

            ctrl.fill_in_request(mgr, &client, &mut request);
            assert!(!request.vers.wait(), "no work for client {}", identity);
            assert_eq!(request.player_swap, swap, "unexpected side for client {}", identity);

            let record = eval_record(
                index,
                request.vers.black_ver,
                request.vers.white_ver,
                swap,
                reward
            );

            assert_eq!(ctrl.feed(&identity, &record), FeedResult::Feeded);
        }
    }

    #[test]
    fn winning_candidate_passes_the_gate() {
        let ctrl = EvalSubCtrl::new(options(), Default::default());
        let mgr = manager();

        ctrl.set_baseline_model(0);
        ctrl.add_new_model_for_evaluation(0, 1);

        // the candidate wins three of four across both sides, 0.75 over
        // the 0.55 bar. rewards are from black's view, so a swapped-side
        // candidate win arrives as a negative reward.
        play_gauntlet(&ctrl, &mgr, &[
            (false, 1.0),
            (true, -1.0),
            (false, 1.0),
            (true, 1.0),
        ]);

        assert_eq!(ctrl.update_state(&mgr), 1);
    }

    #[test]
    fn losing_candidate_is_dropped() {
        let ctrl = EvalSubCtrl::new(options(), Default::default());
        let mgr = manager();

        ctrl.set_baseline_model(0);
        ctrl.add_new_model_for_evaluation(0, 1);

        play_gauntlet(&ctrl, &mgr, &[
            (false, -1.0),
            (true, 1.0),
            (false, -1.0),
            (true, 1.0),
        ]);

        assert_eq!(ctrl.update_state(&mgr), -1);

        // the candidate is gone, nothing is handed out anymore
        let client = mgr.get_client("9");
        let mut request = Request::wait();

        ctrl.fill_in_request(&mgr, &client, &mut request);
        assert!(request.vers.wait());
    }

    #[test]
    fn stale_candidates_are_rejected() {
        let ctrl = EvalSubCtrl::new(options(), Default::default());

        ctrl.set_baseline_model(5);
        ctrl.add_new_model_for_evaluation(4, 6);
        ctrl.add_new_model_for_evaluation(5, 5);

        let mgr = manager();

        assert_eq!(ctrl.update_state(&mgr), -1);
    }

    #[test]
    fn unscheduled_records_are_dropped() {
        let ctrl = EvalSubCtrl::new(options(), Default::default());

        ctrl.set_baseline_model(0);
        assert_eq!(
            ctrl.feed("a", &eval_record(0, 7, 0, false, 1.0)),
            FeedResult::NotRequested
        );
    }

    #[test]
    fn selfplay_records_are_not_eval() {
        let ctrl = EvalSubCtrl::new(options(), Default::default());
        let record = eval_record(0, 3, -1, false, 1.0);

        assert_eq!(ctrl.feed("a", &record), FeedResult::NotEval);
    }
}
