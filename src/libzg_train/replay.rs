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
use std::sync::Mutex;

use rand::Rng;

/// The replay buffer: `num_reader` bounded queues, each guarded by its own
/// mutex so ingress threads rarely contend. Records with black-win parity
/// go to even queues and white-win parity to odd queues, so drawing a
/// queue uniformly yields a balanced outcome mix.
pub struct ReaderQueues<T> {
    queues: Vec<Mutex<VecDeque<T>>>,
    q_min_size: usize,
    q_max_size: usize
}

impl<T> ReaderQueues<T> {
    /// # Arguments
    ///
    /// * `num_reader` -
    /// * `q_min_size` - queues below this are not sampled from
    /// * `q_max_size` - queues at this size drop their oldest entry
    ///
    pub fn new(num_reader: usize, q_min_size: usize, q_max_size: usize) -> Self {
        assert!(num_reader > 0);
        assert!(q_max_size > 0);

        Self {
            queues: (0..num_reader).map(|_| Mutex::new(VecDeque::new())).collect(),
            q_min_size: q_min_size,
            q_max_size: q_max_size
        }
    }

    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    pub fn len(&self) -> usize {
        self.queues.iter()
            .map(|q| q.lock().expect("could not acquire queue lock").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert with parity balancing: `parity` selects the even or odd half
    /// of the queues, uniformly within that half.
    ///
    /// # Arguments
    ///
    /// * `value` -
    /// * `rng` -
    /// * `parity` - true for black-win records
    ///
    pub fn insert_with_parity<R: Rng>(&self, value: T, rng: &mut R, parity: bool) {
        let index = if self.queues.len() >= 2 {
            let half = self.queues.len() / 2;

            2 * rng.gen_range(0..half) + (!parity) as usize
        } else {
            0
        };

        self.insert_into(index, value);
    }

    /// Insert into a queue chosen uniformly, without parity.
    ///
    /// # Arguments
    ///
    /// * `value` -
    /// * `rng` -
    ///
    pub fn insert<R: Rng>(&self, value: T, rng: &mut R) {
        self.insert_into(rng.gen_range(0..self.queues.len()), value);
    }

    pub fn clear(&self) {
        for queue in &self.queues {
            queue.lock().expect("could not acquire queue lock").clear();
        }
    }

    fn insert_into(&self, index: usize, value: T) {
        let mut queue = self.queues[index].lock().expect("could not acquire queue lock");

        while queue.len() >= self.q_max_size {
            queue.pop_front();
        }
        queue.push_back(value);
    }
}

impl<T: Clone> ReaderQueues<T> {
    /// Draw a queue uniformly, then an element uniformly within it.
    /// Returns `None` when the chosen queue has not warmed up yet.
    ///
    /// # Arguments
    ///
    /// * `rng` -
    ///
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Option<T> {
        let queue = &self.queues[rng.gen_range(0..self.queues.len())];
        let queue = queue.lock().expect("could not acquire queue lock");

        if queue.len() < zg_utils::max(self.q_min_size, 1) {
            return None;
        }

        queue.get(rng.gen_range(0..queue.len())).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn parity_splits_across_halves() {
        let queues = ReaderQueues::new(4, 1, 100);
        let mut rng = SmallRng::seed_from_u64(1);

        for i in 0..40 {
            queues.insert_with_parity(i, &mut rng, i % 2 == 0);
        }

        // even queues hold even (black-win) entries, odd queues the rest
        for (index, queue) in queues.queues.iter().enumerate() {
            for &value in queue.lock().unwrap().iter() {
                assert_eq!(value % 2, index % 2, "value {} in queue {}", value, index);
            }
        }
        assert_eq!(queues.len(), 40);
    }

    #[test]
    fn bounded_queues_drop_the_oldest() {
        let queues = ReaderQueues::new(1, 1, 3);
        let mut rng = SmallRng::seed_from_u64(2);

        for i in 0..10 {
            queues.insert(i, &mut rng);
        }

        let queue = queues.queues[0].lock().unwrap();

        assert_eq!(queue.len(), 3);
        assert_eq!(*queue.front().unwrap(), 7);
    }

    #[test]
    fn sampling_respects_the_minimum_size() {
        let queues = ReaderQueues::new(1, 5, 100);
        let mut rng = SmallRng::seed_from_u64(3);

        for i in 0..4 {
            queues.insert(i, &mut rng);
        }
        assert_eq!(queues.sample(&mut rng), None);

        queues.insert(4, &mut rng);
        assert!(queues.sample(&mut rng).is_some());
    }

    #[test]
    fn clear_empties_every_queue() {
        let queues = ReaderQueues::new(3, 1, 100);
        let mut rng = SmallRng::seed_from_u64(4);

        for i in 0..30 {
            queues.insert_with_parity(i, &mut rng, i % 3 == 0);
        }
        assert!(!queues.is_empty());

        queues.clear();
        assert!(queues.is_empty());
        assert_eq!(queues.sample(&mut rng), None);
    }

    #[test]
    fn odd_queue_counts_still_balance_the_reachable_half() {
        let queues = ReaderQueues::new(5, 1, 100);
        let mut rng = SmallRng::seed_from_u64(5);

        for i in 0..20 {
            queues.insert_with_parity(i, &mut rng, true);
        }

        // parity insertion only uses the paired prefix of the queues
        assert_eq!(queues.queues[4].lock().unwrap().len(), 0);
    }
}
