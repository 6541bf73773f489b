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

use crate::options::GameOptions;
use crate::record::{FeedResult, Record, Request};
use crate::record_io::RecordBuffer;
use crate::resign::ResignThresholdCalculator;

/// Whether the trainer has enough fresh games to take another gradient
/// step on the current model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleStatus {
    VersionOld,
    VersionInvalid,
    InsufficientSample,
    SufficientSample
}

/// Bookkeeping for the self-play games of one model version.
struct SelfPlayRecord {
    ver: i64,
    records: RecordBuffer,
    resign_threshold: f64,

    black_win: usize,
    white_win: usize,
    n_black_resign: usize,
    n_white_resign: usize,
    move_histogram: [usize; 4],
    counter: usize,
    num_weight_updates: usize
}

impl SelfPlayRecord {
    fn new(ver: i64, options: &GameOptions) -> Self {
        let prefix = format!(
            "selfplay-{}-{}-{}",
            options.server_id, options.time_signature, ver
        );

        Self {
            ver: ver,
            records: RecordBuffer::new(&options.record_dir, &prefix),
            resign_threshold: options.resign_thres,
            black_win: 0,
            white_win: 0,
            n_black_resign: 0,
            n_white_resign: 0,
            move_histogram: [0; 4],
            counter: 0,
            num_weight_updates: 0
        }
    }

    fn feed(&mut self, record: &Record) {
        let result = &record.result;

        if result.reward > 0.0 {
            self.black_win += 1;
        } else {
            self.white_win += 1;
        }

        // a resigned game ends exactly at the winner's reward
        if (result.reward - 1.0).abs() < 0.1 && result.num_moves % 2 == 1 {
            self.n_white_resign += 1;
        } else if (result.reward + 1.0).abs() < 0.1 && result.num_moves % 2 == 0 {
            self.n_black_resign += 1;
        }

        self.move_histogram[zg_utils::min(result.num_moves / 100, 3)] += 1;
        self.counter += 1;
        self.records.feed(record.clone());

        if self.counter % 100 == 0 {
            info!("{}", self.info());
        }
    }

    fn is_checkpoint(&self, options: &GameOptions) -> bool {
        if options.selfplay_init_num > 0 && options.selfplay_update_num > 0 {
            self.counter == options.selfplay_init_num
                || (self.counter > options.selfplay_init_num
                    && (self.counter - options.selfplay_init_num) % options.selfplay_update_num == 0)
        } else {
            self.counter > 0 && self.counter % 1000 == 0
        }
    }

    fn check_and_save(&mut self, options: &GameOptions) -> bool {
        if self.is_checkpoint(options) {
            self.records.save_current();
            self.records.clear();
            true
        } else {
            false
        }
    }

    fn need_wait_for_more_sample(&self, options: &GameOptions) -> bool {
        if options.selfplay_init_num == 0 {
            return false;
        }
        if self.counter < options.selfplay_init_num {
            return true;
        }
        if options.selfplay_update_num == 0 {
            return false;
        }

        self.counter < options.selfplay_init_num
            + options.selfplay_update_num * self.num_weight_updates
    }

    fn info(&self) -> String {
        let n = self.black_win + self.white_win;

        format!(
            "selfplay[{}]: B/W/A {}/{}/{} ({:.1}% black), resigns B {} W {}, moves {:?}, resign thres {:.4}",
            self.ver,
            self.black_win,
            self.white_win,
            n,
            100.0 * self.black_win as f64 / (n as f64 + 1e-10),
            self.n_black_resign,
            self.n_white_resign,
            self.move_histogram,
            self.resign_threshold
        )
    }
}

struct Inner {
    curr_ver: i64,
    perfs: HashMap<i64, SelfPlayRecord>,
    calculator: ResignThresholdCalculator,
    total_selfplay: usize
}

/// The server-side self-play scheduler: tracks the current model version,
/// counts the games it has produced, paces the trainer, and keeps the
/// resign threshold calibrated.
pub struct SelfPlaySubCtrl {
    options: GameOptions,
    mcts_opt: zg_mcts::options::SearchOptions,
    inner: Mutex<Inner>
}

impl SelfPlaySubCtrl {
    pub fn new(options: GameOptions, mcts_opt: zg_mcts::options::SearchOptions) -> Self {
        let calculator = ResignThresholdCalculator::new(
            options.resign_target_hist_size,
            options.resign_target_fp_rate,
            options.resign_thres,
            options.resign_thres_lower_bound,
            options.resign_thres_upper_bound
        );

        Self {
            options: options,
            mcts_opt: mcts_opt,
            inner: Mutex::new(Inner {
                curr_ver: -1,
                perfs: HashMap::new(),
                calculator: calculator,
                total_selfplay: 0
            })
        }
    }

    /// Ingest one record. Only self-play games for the current model count
    /// toward the quota, everything else is classified and returned.
    ///
    /// # Arguments
    ///
    /// * `record` -
    ///
    pub fn feed(&self, record: &Record) -> FeedResult {
        let mut inner = self.inner.lock().expect("could not acquire selfplay lock");

        inner.calculator.feed(record);

        if !record.request.vers.is_selfplay() {
            return FeedResult::NotSelfplay;
        }
        if inner.curr_ver != record.request.vers.black_ver {
            return FeedResult::VersionMismatch;
        }

        let curr_ver = inner.curr_ver;
        let fed = match inner.perfs.get_mut(&curr_ver) {
            None => false,
            Some(perf) => {
                perf.feed(record);
                perf.check_and_save(&self.options);
                true
            }
        };

        if !fed {
            return FeedResult::NotRequested;
        }

        inner.total_selfplay += 1;
        if inner.total_selfplay % 1000 == 0 {
            info!(
                "selfplay: {} games total, {}",
                inner.total_selfplay,
                inner.calculator.info()
            );
        }
        FeedResult::Feeded
    }

    pub fn resign_threshold(&self) -> f64 {
        self.inner.lock().expect("could not acquire selfplay lock").calculator.threshold()
    }

    pub fn curr_model(&self) -> i64 {
        self.inner.lock().expect("could not acquire selfplay lock").curr_ver
    }

    /// Install `ver` as the current self-play model. Returns false if it
    /// already was.
    ///
    /// # Arguments
    ///
    /// * `ver` -
    ///
    pub fn set_curr_model(&self, ver: i64) -> bool {
        let mut inner = self.inner.lock().expect("could not acquire selfplay lock");

        if inner.curr_ver == ver {
            return false;
        }

        info!("selfplay model: {} -> {}", inner.curr_ver, ver);
        inner.curr_ver = ver;

        if !inner.perfs.contains_key(&ver) {
            let threshold = inner.calculator.update_threshold(0.01);
            let mut perf = SelfPlayRecord::new(ver, &self.options);

            perf.resign_threshold = threshold;
            inner.perfs.insert(ver, perf);
        }
        true
    }

    /// Whether `selfplay_ver` still needs more games before the trainer
    /// may update weights again.
    ///
    /// # Arguments
    ///
    /// * `selfplay_ver` -
    ///
    pub fn need_wait_for_more_sample(&self, selfplay_ver: i64) -> SampleStatus {
        let inner = self.inner.lock().expect("could not acquire selfplay lock");

        if selfplay_ver < inner.curr_ver {
            return SampleStatus::VersionOld;
        }

        match inner.perfs.get(&inner.curr_ver) {
            None => SampleStatus::VersionInvalid,
            Some(perf) => {
                if perf.need_wait_for_more_sample(&self.options) {
                    SampleStatus::InsufficientSample
                } else {
                    SampleStatus::SufficientSample
                }
            }
        }
    }

    pub fn notify_weight_update(&self) {
        let mut inner = self.inner.lock().expect("could not acquire selfplay lock");
        let curr_ver = inner.curr_ver;

        if let Some(perf) = inner.perfs.get_mut(&curr_ver) {
            perf.num_weight_updates += 1;
        }
    }

    pub fn num_selfplay_curr_model(&self) -> usize {
        let inner = self.inner.lock().expect("could not acquire selfplay lock");

        inner.perfs.get(&inner.curr_ver).map(|perf| perf.counter).unwrap_or(0)
    }

    /// Fill a self-play work order into `request`, or a wait order when no
    /// model has been installed yet.
    ///
    /// # Arguments
    ///
    /// * `request` -
    ///
    pub fn fill_in_request(&self, request: &mut Request) {
        let inner = self.inner.lock().expect("could not acquire selfplay lock");

        if inner.curr_ver < 0 {
            request.vers.set_wait();
            return;
        }

        request.vers.black_ver = inner.curr_ver;
        request.vers.white_ver = -1;
        request.vers.mcts_opt = self.mcts_opt.clone();
        request.resign_thres = inner.perfs.get(&inner.curr_ver)
            .map(|perf| perf.resign_threshold as f32)
            .unwrap_or(self.options.resign_thres as f32);
        request.never_resign_prob = self.options.never_resign_prob;
        request.async_mode = self.options.selfplay_async;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{GameResult, ModelPair};

    fn selfplay_record(ver: i64, reward: f32) -> Record {
        Record {
            timestamp: 0,
            thread_id: 0,
            seq: 0,
            request: Request {
                vers: ModelPair { black_ver: ver, white_ver: -1, ..Default::default() },
                ..Default::default()
            },
            result: GameResult {
                reward: reward,
                num_moves: 50,
                values: vec! [0.0; 50],
                ..Default::default()
            }
        }
    }

    fn options() -> GameOptions {
        GameOptions {
            selfplay_init_num: 4,
            selfplay_update_num: 2,
            never_resign_prob: 0.1,
            ..GameOptions::for_tests()
        }
    }

    #[test]
    fn feed_classifies_records() {
        let ctrl = SelfPlaySubCtrl::new(options(), Default::default());

        ctrl.set_curr_model(3);

        assert_eq!(ctrl.feed(&selfplay_record(3, 1.0)), FeedResult::Feeded);
        assert_eq!(ctrl.feed(&selfplay_record(2, 1.0)), FeedResult::VersionMismatch);

        let mut eval = selfplay_record(3, 1.0);

        eval.request.vers.white_ver = 1;
        assert_eq!(ctrl.feed(&eval), FeedResult::NotSelfplay);
        assert_eq!(ctrl.num_selfplay_curr_model(), 1);
    }

    #[test]
    fn quota_paces_the_trainer() {
        let ctrl = SelfPlaySubCtrl::new(options(), Default::default());

        ctrl.set_curr_model(0);
        assert_eq!(ctrl.need_wait_for_more_sample(0), SampleStatus::InsufficientSample);

        for _ in 0..4 {
            ctrl.feed(&selfplay_record(0, 1.0));
        }
        assert_eq!(ctrl.need_wait_for_more_sample(0), SampleStatus::SufficientSample);

        // each weight update raises the bar by `selfplay_update_num`
        ctrl.notify_weight_update();
        assert_eq!(ctrl.need_wait_for_more_sample(0), SampleStatus::InsufficientSample);

        ctrl.feed(&selfplay_record(0, -1.0));
        ctrl.feed(&selfplay_record(0, 1.0));
        assert_eq!(ctrl.need_wait_for_more_sample(0), SampleStatus::SufficientSample);

        assert_eq!(ctrl.need_wait_for_more_sample(-1), SampleStatus::VersionOld);
    }

    #[test]
    fn request_carries_the_current_model() {
        let ctrl = SelfPlaySubCtrl::new(options(), Default::default());
        let mut request = Request::wait();

        ctrl.fill_in_request(&mut request);
        assert!(request.vers.wait());

        ctrl.set_curr_model(7);
        ctrl.fill_in_request(&mut request);
        assert_eq!(request.vers.black_ver, 7);
        assert_eq!(request.vers.white_ver, -1);
        assert!((request.never_resign_prob - 0.1).abs() < 1e-6);
    }

    #[test]
    fn set_curr_model_is_idempotent() {
        let ctrl = SelfPlaySubCtrl::new(options(), Default::default());

        assert!(ctrl.set_curr_model(5));
        assert!(!ctrl.set_curr_model(5));
        assert_eq!(ctrl.curr_model(), 5);
    }
}
