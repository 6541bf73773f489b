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

use std::collections::VecDeque;

use rand::Rng;

use crate::record::Record;

/// Tracks the lowest value the eventual winner saw in never-resign games,
/// and keeps the resign threshold at the quantile matching the tolerated
/// false-positive rate. Values live in `[0, 2]`: the winner's predicted
/// value shifted by one.
pub struct ResignThresholdCalculator {
    hist_size: usize,
    fp_target: f64,
    threshold: f64,
    min_threshold: f64,
    max_threshold: f64,
    winner_min_values: VecDeque<f64>,

    num_games: usize,
    num_games_black_win: usize,
    num_never_resign: usize,
    num_false_positive: usize
}

impl ResignThresholdCalculator {
    /// # Arguments
    ///
    /// * `hist_size` - how many games the sliding window holds
    /// * `fp_target` - the tolerated false-positive rate
    /// * `initial` -
    /// * `min_threshold` -
    /// * `max_threshold` -
    ///
    pub fn new(
        hist_size: usize,
        fp_target: f64,
        initial: f64,
        min_threshold: f64,
        max_threshold: f64
    ) -> Self {
        assert!(hist_size > 0);
        assert!(fp_target > 1e-6 && fp_target < 1.0 - 1e-6);
        assert!(0.0 <= min_threshold && min_threshold <= max_threshold && max_threshold <= 2.0);

        Self {
            hist_size: hist_size,
            fp_target: fp_target,
            threshold: initial,
            min_threshold: min_threshold,
            max_threshold: max_threshold,
            winner_min_values: VecDeque::new(),
            num_games: 0,
            num_games_black_win: 0,
            num_never_resign: 0,
            num_false_positive: 0
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Digest one finished game. Only games whose winning side was flagged
    /// never-resign contribute to the window, since only there the true
    /// outcome is visible past a would-be resignation.
    ///
    /// # Arguments
    ///
    /// * `record` -
    ///
    pub fn feed(&mut self, record: &Record) {
        let result = &record.result;

        self.num_games += 1;
        if result.reward > 0.0 {
            self.num_games_black_win += 1;
        }

        if !result.black_never_resign && !result.white_never_resign {
            return;
        }
        self.num_never_resign += 1;

        let black_won = result.reward > 0.0;

        if (black_won && result.black_never_resign) || (!black_won && result.white_never_resign) {
            // odd plies are white's predictions, even plies black's
            let start = if black_won { 0 } else { 1 };
            let mut min_value = 2.0f64;

            for index in (start..result.values.len()).step_by(2) {
                let value = if black_won {
                    1.0 + result.values[index] as f64
                } else {
                    1.0 - result.values[index] as f64
                };

                if value < min_value {
                    min_value = value;
                }
            }

            self.feed_winner_min_value(min_value);
        }
    }

    /// Move the threshold toward the current window quantile, at most
    /// `max_delta` per update, clamped into the configured range.
    ///
    /// # Arguments
    ///
    /// * `max_delta` -
    ///
    pub fn update_threshold(&mut self, max_delta: f64) -> f64 {
        let position = (self.fp_target * self.winner_min_values.len() as f64).round() as usize;

        if position < 2 || position + 2 >= self.winner_min_values.len() {
            return self.threshold;
        }

        let mut values = self.winner_min_values.iter().cloned().collect::<Vec<_>>();

        values.sort_by(|a, b| a.partial_cmp(b).expect("NaN in resign window"));

        let old = self.threshold;

        self.threshold = values[position]
            .min(old + max_delta)
            .max(old - max_delta)
            .max(self.min_threshold)
            .min(self.max_threshold);
        self.threshold
    }

    pub fn info(&self) -> String {
        format!(
            "resign threshold: {:.4}, fp target: {}, #games: {} (black wins {}), #never-resign: {}, #fp: {}",
            self.threshold,
            self.fp_target,
            self.num_games,
            self.num_games_black_win,
            self.num_never_resign,
            self.num_false_positive
        )
    }

    fn feed_winner_min_value(&mut self, value: f64) {
        while self.winner_min_values.len() >= self.hist_size {
            self.winner_min_values.pop_front();
        }
        self.winner_min_values.push_back(value);

        if value < self.threshold {
            self.num_false_positive += 1;
        }
    }
}

/// The per-game resignation decision, rolled once per game.
#[derive(Clone, Debug)]
pub struct ResignCheck {
    pub resign_thres: f32,
    pub never_resign_prob: f32,
    pub never_resign: bool
}

impl ResignCheck {
    pub fn new(resign_thres: f32, never_resign_prob: f32) -> Self {
        Self {
            resign_thres: resign_thres,
            never_resign_prob: never_resign_prob,
            never_resign: false
        }
    }

    /// Roll the never-resign flag for a fresh game.
    ///
    /// # Arguments
    ///
    /// * `rng` -
    ///
    pub fn reset<R: Rng>(&mut self, rng: &mut R) {
        self.never_resign = rng.gen::<f32>() < self.never_resign_prob;
    }

    /// Returns true if the player seeing `value` (from its own point of
    /// view, in `[-1, 1]`) should resign now.
    ///
    /// # Arguments
    ///
    /// * `value` -
    ///
    pub fn check(&self, value: f32) -> bool {
        !self.never_resign && (1.0 + value) < self.resign_thres
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{GameResult, Request};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn record(reward: f32, values: Vec<f32>, never_resign: bool) -> Record {
        Record {
            timestamp: 0,
            thread_id: 0,
            seq: 0,
            request: Request::default(),
            result: GameResult {
                reward: reward,
                values: values,
                black_never_resign: never_resign,
                white_never_resign: never_resign,
                ..Default::default()
            }
        }
    }

    #[test]
    fn quantile_update_is_capped_and_clamped() {
        let mut calc = ResignThresholdCalculator::new(100, 0.33, 0.05, 1e-9, 0.50);

        // six never-resign black wins whose minima span the window from
        // the scenario: [0.30, 0.10, 0.08, 0.02, 0.50, 0.40]
        for &min in &[0.30f32, 0.10, 0.08, 0.02, 0.50, 0.40] {
            calc.feed(&record(1.0, vec! [min - 1.0], true));
        }

        // quantile position round(0.33 * 6) = 2 lands on 0.10, but the
        // step toward it is capped at 0.01
        let updated = calc.update_threshold(0.01);

        assert!((updated - 0.06).abs() < 1e-9, "got {}", updated);

        let updated = calc.update_threshold(0.01);

        assert!((updated - 0.07).abs() < 1e-9, "got {}", updated);
    }

    #[test]
    fn small_windows_leave_the_threshold_alone() {
        let mut calc = ResignThresholdCalculator::new(100, 0.33, 0.05, 1e-9, 0.50);

        calc.feed(&record(1.0, vec! [-0.9], true));
        assert_eq!(calc.update_threshold(0.01), 0.05);
    }

    #[test]
    fn resignable_games_are_ignored() {
        let mut calc = ResignThresholdCalculator::new(100, 0.33, 0.05, 1e-9, 0.50);

        for _ in 0..10 {
            calc.feed(&record(1.0, vec! [-0.99], false));
        }
        assert_eq!(calc.update_threshold(0.01), 0.05);
    }

    #[test]
    fn loser_side_never_resign_does_not_count() {
        let mut calc = ResignThresholdCalculator::new(100, 0.33, 0.05, 1e-9, 0.50);
        let mut r = record(-1.0, vec! [-0.5, 0.5], true);

        // white won and only black was flagged, the winner's trace is
        // not oracle-visible
        r.result.white_never_resign = false;
        calc.feed(&r);
        assert_eq!(calc.update_threshold(0.01), 0.05);
    }

    #[test]
    fn white_wins_use_odd_plies() {
        let mut calc = ResignThresholdCalculator::new(10, 0.4, 0.05, 1e-9, 0.50);

        // white's values sit at odd indices, negated into white's view
        for _ in 0..6 {
            calc.feed(&record(-1.0, vec! [0.9, 0.8, 0.9, -0.2], true));
        }

        // window holds 1 - 0.8 = 0.2 minima at every slot, so the
        // threshold climbs toward it
        let updated = calc.update_threshold(1.0);

        assert!((updated - 0.2).abs() < 1e-6, "got {}", updated);
    }

    #[test]
    fn resign_check_honors_the_flag() {
        let mut rng = SmallRng::seed_from_u64(3);
        let mut check = ResignCheck::new(0.05, 1.0);

        check.reset(&mut rng);
        assert!(check.never_resign);
        assert!(!check.check(-0.99));

        check.never_resign = false;
        assert!(check.check(-0.99));
        assert!(!check.check(-0.5));
    }
}
