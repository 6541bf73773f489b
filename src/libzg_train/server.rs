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

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::sync::Mutex;

use crate::client_manager::{ClientManager, Timer};
use crate::ctrl_eval::EvalSubCtrl;
use crate::ctrl_selfplay::{SampleStatus, SelfPlaySubCtrl};
use crate::options::GameOptions;
use crate::record::{
    string_to_moves, ClientType, FeedResult, Record, Records, Request, RequestSeq
};
use crate::record_io;
use crate::replay::ReaderQueues;
use zg_mcts::options::SearchOptions;

/// The server-side brain: ingests record batches, schedules self-play and
/// evaluation work per client poll, maintains the replay buffer, and
/// promotes models that pass the evaluation gate.
///
/// Promotion runs on a dedicated mail thread so that the network ingress
/// path never blocks on it; `set_current_model` is confirmed back to the
/// caller before any reply can carry the new version out.
pub struct TrainCtrl {
    options: GameOptions,
    client_mgr: ClientManager,
    selfplay: SelfPlaySubCtrl,
    eval: EvalSubCtrl,
    replay: Arc<ReaderQueues<Record>>,
    eval_mode: AtomicBool,
    rng: Mutex<SmallRng>,

    promote_tx: Sender<i64>,
    confirm_rx: Receiver<i64>,
    promote_thread: Mutex<Option<JoinHandle<()>>>
}

impl TrainCtrl {
    pub fn new(options: GameOptions, mcts_opt: SearchOptions, timer: Timer) -> Arc<Self> {
        let replay = Arc::new(ReaderQueues::new(
            options.num_reader,
            options.q_min_size,
            options.q_max_size
        ));
        let (promote_tx, promote_rx) = unbounded();
        let (confirm_tx, confirm_rx) = unbounded();

        let out = Arc::new(Self {
            client_mgr: ClientManager::new(options.client_max_delay_sec, 0.5, timer),
            selfplay: SelfPlaySubCtrl::new(options.clone(), mcts_opt.clone()),
            eval: EvalSubCtrl::new(options.clone(), mcts_opt),
            replay: replay,
            eval_mode: AtomicBool::new(false),
            rng: Mutex::new(SmallRng::seed_from_u64(zg_utils::sec_since_epoch())),
            promote_tx: promote_tx,
            confirm_rx: confirm_rx,
            promote_thread: Mutex::new(None),
            options: options
        });

        let worker = out.clone();
        let handle = thread::Builder::new()
            .name("train_ctrl_promote".into())
            .spawn(move || worker.promote_loop(promote_rx, confirm_tx))
            .expect("could not spawn promotion thread");

        *out.promote_thread.lock().expect("could not acquire promote lock") = Some(handle);
        out
    }

    pub fn options(&self) -> &GameOptions {
        &self.options
    }

    pub fn client_manager(&self) -> &ClientManager {
        &self.client_mgr
    }

    pub fn selfplay(&self) -> &SelfPlaySubCtrl {
        &self.selfplay
    }

    pub fn eval(&self) -> &EvalSubCtrl {
        &self.eval
    }

    pub fn replay_buffer(&self) -> &Arc<ReaderQueues<Record>> {
        &self.replay
    }

    /// Install the very first model: it becomes both the baseline and the
    /// self-play version.
    ///
    /// # Arguments
    ///
    /// * `init_version` -
    ///
    pub fn set_initial_version(&self, init_version: i64) {
        info!("initial version: {}", init_version);
        self.eval.set_baseline_model(init_version);

        if self.selfplay.curr_model() < 0 {
            self.selfplay.set_curr_model(self.eval.best_model());
        }
    }

    /// The trainer produced `new_version`. With evaluation disabled it is
    /// promoted on the spot, otherwise it joins the gauntlet.
    ///
    /// # Arguments
    ///
    /// * `selfplay_ver` -
    /// * `new_version` -
    ///
    pub fn add_new_model_for_evaluation(&self, selfplay_ver: i64, new_version: i64) {
        if self.options.eval_num_games == 0 {
            self.promote(new_version);
        } else {
            self.eval.add_new_model_for_evaluation(selfplay_ver, new_version);
            self.wait_for_sufficient_selfplay(selfplay_ver);
        }
    }

    /// Freeze self-play scheduling and run a single candidate against a
    /// chosen incumbent.
    ///
    /// # Arguments
    ///
    /// * `new_ver` -
    /// * `old_ver` -
    ///
    pub fn set_eval_mode(&self, new_ver: i64, old_ver: i64) {
        info!("eval mode: {} vs {}", new_ver, old_ver);
        self.client_mgr.set_selfplay_only_ratio(0.0);
        self.eval.set_baseline_model(old_ver);
        self.eval.add_new_model_for_evaluation(old_ver, new_ver);
        self.eval_mode.store(true, Ordering::Release);
    }

    /// Block the trainer until the current model has produced its quota
    /// of fresh games.
    ///
    /// # Arguments
    ///
    /// * `selfplay_ver` -
    ///
    pub fn wait_for_sufficient_selfplay(&self, selfplay_ver: i64) {
        loop {
            match self.selfplay.need_wait_for_more_sample(selfplay_ver) {
                SampleStatus::InsufficientSample => {
                    debug!("insufficient sample for model {}, waiting", selfplay_ver);
                    thread::sleep(Duration::from_millis(self.options.wait_retry_ms));
                },
                SampleStatus::SufficientSample => {
                    self.selfplay.notify_weight_update();
                    return;
                },
                _ => {
                    return;
                }
            }
        }
    }

    /// Network ingress: one record batch from one client.
    ///
    /// # Arguments
    ///
    /// * `records` -
    ///
    pub fn on_receive(&self, records: &Records) {
        let identity = &records.identity;

        self.client_mgr.update_states(identity, &records.states);

        for record in &records.records {
            let selfplay_res = self.selfplay.feed(record);

            // mismatched versions still balance the replay buffer, they
            // just do not count toward the current quota
            if selfplay_res == FeedResult::Feeded || selfplay_res == FeedResult::VersionMismatch {
                let mut rng = self.rng.lock().expect("could not acquire rng lock");

                self.replay.insert_with_parity(
                    record.clone(),
                    &mut *rng,
                    record.result.reward > 0.0
                );
            }

            self.eval.feed(identity, record);
        }

        self.check_new_model();
    }

    /// Bootstrap from previously persisted record files, e.g. when a
    /// server restarts with an existing corpus. Records whose move
    /// sequence does not decode are dropped.
    ///
    /// # Arguments
    ///
    /// * `paths` -
    ///
    pub fn load_offline_records<P: AsRef<Path>>(&self, paths: &[P]) {
        for path in paths {
            let path = path.as_ref();
            let mut payload = match record_io::load_records(path) {
                Ok(payload) => payload,
                Err(reason) => {
                    warn!("could not read {:?}: {}", path, reason);
                    continue;
                }
            };
            let before = payload.records.len();

            payload.records.retain(|record| {
                string_to_moves(&record.result.content).is_some()
            });

            if payload.records.len() < before {
                warn!(
                    "{:?}: dropped {} records with corrupt move strings",
                    path,
                    before - payload.records.len()
                );
            }

            info!("loaded {} offline records from {:?}", payload.records.len(), path);
            self.on_receive(&payload);
        }
    }

    /// Network egress: the next work order for `identity`.
    ///
    /// # Arguments
    ///
    /// * `identity` -
    ///
    pub fn on_reply(&self, identity: &str) -> RequestSeq {
        let client = self.client_mgr.get_client(identity);

        if client.just_allocated() {
            info!("first poll from {} ({:?})", identity, client.client_type);
        }

        let mut request = Request::wait();

        request.client_type = client.client_type;

        match client.client_type {
            ClientType::SelfplayOnly => {
                if !self.eval_mode.load(Ordering::Acquire) {
                    self.selfplay.fill_in_request(&mut request);
                }
            },
            ClientType::EvalThenSelfplay => {
                self.eval.fill_in_request(&self.client_mgr, &client, &mut request);

                if request.vers.wait() && !self.eval_mode.load(Ordering::Acquire) {
                    self.selfplay.fill_in_request(&mut request);
                }
            }
        }

        let out = RequestSeq { request: request, seq: client.seq };

        self.client_mgr.inc_seq(identity);
        out
    }

    /// Stop the promotion thread. Used on shutdown.
    pub fn stop(&self) {
        self.promote_tx.send(-1).ok();

        if let Some(handle) = self.promote_thread.lock().expect("could not acquire promote lock").take() {
            handle.join().expect("could not join promotion thread");
        }
    }

    fn check_new_model(&self) -> bool {
        let new_model = self.eval.update_state(&self.client_mgr);

        if new_model >= 0 {
            self.promote(new_model);
            true
        } else {
            false
        }
    }

    /// Hand `ver` to the promotion thread and wait for the confirmation,
    /// so the new version is fully installed before this returns.
    fn promote(&self, ver: i64) {
        self.promote_tx.send(ver).expect("promotion thread is gone");

        while let Ok(done) = self.confirm_rx.recv() {
            if done == ver {
                break;
            }
        }
    }

    fn promote_loop(&self, rx: Receiver<i64>, confirm: Sender<i64>) {
        while let Ok(ver) = rx.recv() {
            if ver < 0 {
                break;
            }

            self.eval.set_baseline_model(ver);

            let old_ver = self.selfplay.curr_model();

            self.selfplay.set_curr_model(ver);
            info!("promoted model {} -> {}", old_ver, ver);

            if !self.options.keep_prev_selfplay {
                self.replay.clear();
            }

            confirm.send(ver).ok();
        }
    }
}

impl Drop for TrainCtrl {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_manager::tests::manual_timer;
    use crate::record::{GameResult, ModelPair, ThreadState};

    fn options() -> GameOptions {
        GameOptions {
            eval_num_games: 0,
            selfplay_init_num: 2,
            selfplay_update_num: 1,
            q_min_size: 1,
            num_reader: 4,
            ..GameOptions::for_tests()
        }
    }

    fn ctrl_with(options: GameOptions) -> Arc<TrainCtrl> {
        let (_, timer) = manual_timer();

        TrainCtrl::new(options, SearchOptions::default(), timer)
    }

    fn selfplay_records(identity: &str, ver: i64, rewards: &[f32]) -> Records {
        let mut records = Records::new(identity);

        for (i, &reward) in rewards.iter().enumerate() {
            records.records.push(Record {
                timestamp: 0,
                thread_id: i,
                seq: 0,
                request: Request {
                    vers: ModelPair { black_ver: ver, white_ver: -1, ..Default::default() },
                    ..Default::default()
                },
                result: GameResult { reward: reward, ..Default::default() }
            });
        }

        records.update_state(ThreadState { thread_id: 0, ..Default::default() });
        records
    }

    #[test]
    fn initial_version_seeds_both_controllers() {
        let ctrl = ctrl_with(options());

        ctrl.set_initial_version(0);
        assert_eq!(ctrl.selfplay().curr_model(), 0);
        assert_eq!(ctrl.eval().best_model(), 0);
    }

    #[test]
    fn zero_eval_games_promotes_immediately() {
        let ctrl = ctrl_with(options());

        ctrl.set_initial_version(0);
        ctrl.add_new_model_for_evaluation(0, 1);

        assert_eq!(ctrl.selfplay().curr_model(), 1);
        assert_eq!(ctrl.eval().best_model(), 1);
    }

    #[test]
    fn promotion_clears_the_replay_buffer() {
        let ctrl = ctrl_with(options());

        ctrl.set_initial_version(0);
        ctrl.on_receive(&selfplay_records("client-1", 0, &[1.0, -1.0, 1.0]));
        assert_eq!(ctrl.replay_buffer().len(), 3);

        ctrl.add_new_model_for_evaluation(0, 1);
        assert!(ctrl.replay_buffer().is_empty());
    }

    #[test]
    fn keep_prev_selfplay_retains_the_buffer() {
        let ctrl = ctrl_with(GameOptions { keep_prev_selfplay: true, ..options() });

        ctrl.set_initial_version(0);
        ctrl.on_receive(&selfplay_records("client-1", 0, &[1.0]));
        ctrl.add_new_model_for_evaluation(0, 1);

        assert_eq!(ctrl.replay_buffer().len(), 1);
    }

    #[test]
    fn mismatched_versions_feed_the_buffer_but_not_the_quota() {
        let ctrl = ctrl_with(options());

        ctrl.set_initial_version(5);
        ctrl.on_receive(&selfplay_records("client-1", 3, &[1.0, -1.0]));

        assert_eq!(ctrl.replay_buffer().len(), 2);
        assert_eq!(ctrl.selfplay().num_selfplay_curr_model(), 0);
    }

    #[test]
    fn replies_carry_increasing_sequence_numbers() {
        let ctrl = ctrl_with(options());

        ctrl.set_initial_version(2);

        let first = ctrl.on_reply("client-1");
        let second = ctrl.on_reply("client-1");

        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert_eq!(first.request.vers.black_ver, 2);
        assert_eq!(first.request.vers.white_ver, -1);
    }

    #[test]
    fn no_model_means_wait_orders() {
        let ctrl = ctrl_with(options());
        let reply = ctrl.on_reply("client-1");

        assert!(reply.request.vers.wait());
    }

    #[test]
    fn offline_records_bootstrap_the_replay_buffer() {
        use crate::record_io::RecordBuffer;
        use std::{env, fs};

        let dir = env::temp_dir().join("zg_server_offline_test");
        let dir = dir.to_string_lossy().to_string();
        let mut buffer = RecordBuffer::new(&dir, "selfplay-offline-0");

        // two games with sound move strings, one corrupted on disk
        for content in ["aabb", "ccddzz", "a"] {
            let mut records = selfplay_records("offline", 0, &[1.0]);

            records.records[0].result.content = content.to_string();
            buffer.feed(records.records.remove(0));
        }

        let path = buffer.save_current().expect("nothing was written");
        let ctrl = ctrl_with(options());

        ctrl.set_initial_version(0);
        ctrl.load_offline_records(&[&path]);

        assert_eq!(ctrl.replay_buffer().len(), 2);
        assert_eq!(ctrl.selfplay().num_selfplay_curr_model(), 2);

        fs::remove_file(path).ok();
    }
}
