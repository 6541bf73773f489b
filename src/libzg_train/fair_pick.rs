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

//! Fairness-aware allocation of evaluation game slots across workers. A
//! `Pick` hands out `num_request` games in layers of at most
//! `max_request_per_layer` slots, one slot per client, and reclaims the
//! slots of clients that stopped heartbeating so a dead worker cannot
//! stall the batch.

use std::collections::HashMap;

use crate::client_manager::ClientManager;

/// The state of one reserved slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotStatus {
    Wait,
    Settled,
    Stuck
}

#[derive(Clone, Debug)]
struct Slot {
    reward: f32,
    status: SlotStatus
}

impl Slot {
    fn new() -> Self {
        Self { reward: 0.0, status: SlotStatus::Wait }
    }

    fn settle(&mut self, reward: f32) -> bool {
        if self.status == SlotStatus::Settled {
            return false;
        }

        self.reward = reward;
        self.status = SlotStatus::Settled;
        true
    }
}

/// Win/loss bookkeeping over the settled slots of a batch.
#[derive(Clone, Copy, Debug, Default)]
pub struct WinCount {
    n_done: usize,
    n_win: usize,
    n_stuck: usize
}

impl WinCount {
    pub fn add(&mut self, reward: f32) {
        if reward > 0.0 {
            self.n_win += 1;
        }
        self.n_done += 1;
    }

    pub fn set_num_stuck(&mut self, n_stuck: usize) {
        self.n_stuck = n_stuck;
    }

    pub fn n_done(&self) -> usize {
        self.n_done
    }

    pub fn n_win(&self) -> usize {
        self.n_win
    }

    pub fn n_stuck(&self) -> usize {
        self.n_stuck
    }

    pub fn winrate(&self) -> f32 {
        if self.n_done > 0 {
            self.n_win as f32 / self.n_done as f32
        } else {
            0.0
        }
    }

    /// A batch is done when every non-stuck slot has settled.
    pub fn is_done(&self, n_request: usize) -> bool {
        self.n_stuck + self.n_done == n_request
    }

    pub fn merge(&mut self, other: &WinCount) {
        self.n_done += other.n_done;
        self.n_win += other.n_win;
        self.n_stuck += other.n_stuck;
    }
}

/// The outcome of trying to reserve a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterResult {
    NewlyRegistered,
    RegisteredWaiting,
    RegisteredSettled,
    AtCapacity
}

impl RegisterResult {
    /// Returns true if the client should actually play the game it asked
    /// about.
    pub fn need_request(self) -> bool {
        matches!(self, RegisterResult::NewlyRegistered | RegisterResult::RegisteredWaiting)
    }
}

/// The outcome of reporting a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddResult {
    NotRegistered,
    NewlyAdded,
    OverflowNotAdded
}

/// One layer of slot reservations, at most one per client.
struct BatchRequest {
    max_num_request: usize,
    slots: HashMap<String, Slot>,
    win_count: WinCount
}

impl BatchRequest {
    fn new(max_num_request: usize) -> Self {
        Self {
            max_num_request: max_num_request,
            slots: HashMap::new(),
            win_count: WinCount::default()
        }
    }

    fn reg(&mut self, identity: &str) -> RegisterResult {
        match self.slots.get(identity) {
            Some(slot) if slot.status == SlotStatus::Wait => RegisterResult::RegisteredWaiting,
            Some(_) => RegisterResult::RegisteredSettled,
            None => {
                if self.slots.len() >= self.max_num_request {
                    RegisterResult::AtCapacity
                } else {
                    self.slots.insert(identity.to_string(), Slot::new());
                    RegisterResult::NewlyRegistered
                }
            }
        }
    }

    // Results from clients that never registered are dropped, they may
    // carry selection bias.
    fn add(&mut self, identity: &str, reward: f32) -> AddResult {
        match self.slots.get_mut(identity) {
            None => AddResult::NotRegistered,
            Some(slot) => {
                if !slot.settle(reward) {
                    return AddResult::OverflowNotAdded;
                }

                self.win_count.add(reward);
                AddResult::NewlyAdded
            }
        }
    }

    /// Reclassify unsettled slots whose client died. A reclaimed slot no
    /// longer counts toward the layer's completion.
    fn check_stuck(&mut self, mgr: &ClientManager) {
        let now = mgr.now();
        let mut n_stuck = 0;

        for (identity, slot) in self.slots.iter_mut() {
            if slot.status == SlotStatus::Settled {
                continue;
            }

            let stuck = match mgr.get_client_if_known(identity) {
                Some(info) => info.is_stuck(now).0,
                None => true
            };

            slot.status = if stuck { SlotStatus::Stuck } else { SlotStatus::Wait };
            if stuck {
                n_stuck += 1;
            }
        }

        self.win_count.set_num_stuck(n_stuck);
    }

    fn is_done(&self) -> bool {
        !self.slots.is_empty() && self.win_count.is_done(self.slots.len())
    }

    fn n_reg(&self) -> usize {
        self.slots.len()
    }
}

/// Distributes `num_request` evaluation games across the eval machines in
/// layers, rolling finished layers into the running win count.
pub struct Pick {
    num_request: usize,
    max_request_per_layer: usize,
    remaining_request: i64,
    request: BatchRequest,
    win_count: WinCount,
    num_finished_layers: usize
}

impl Pick {
    /// # Arguments
    ///
    /// * `num_request` -
    /// * `max_request_per_layer` -
    ///
    pub fn new(num_request: usize, max_request_per_layer: usize) -> Self {
        let max_request_per_layer = zg_utils::max(max_request_per_layer, 1);
        let mut out = Self {
            num_request: num_request,
            max_request_per_layer: max_request_per_layer,
            remaining_request: num_request as i64,
            request: BatchRequest::new(0),
            win_count: WinCount::default(),
            num_finished_layers: 0
        };

        out.set_new_request();
        out
    }

    /// Reserve a slot for `identity` in the current layer.
    ///
    /// # Arguments
    ///
    /// * `identity` -
    ///
    pub fn reg(&mut self, identity: &str) -> RegisterResult {
        self.request.reg(identity)
    }

    /// Report the result of the game `identity` played. Registration must
    /// have happened first.
    ///
    /// # Arguments
    ///
    /// * `identity` -
    /// * `reward` -
    ///
    pub fn add(&mut self, identity: &str, reward: f32) -> AddResult {
        self.request.add(identity, reward)
    }

    /// Sweep the current layer for dead clients and, if it completed, roll
    /// it up and open the next one.
    ///
    /// # Arguments
    ///
    /// * `mgr` -
    ///
    pub fn check_stuck(&mut self, mgr: &ClientManager) {
        self.request.check_stuck(mgr);

        if self.request.is_done() {
            self.win_count.merge(&self.request.win_count);
            self.remaining_request -= self.request.win_count.n_done() as i64;
            self.set_new_request();
        }
    }

    pub fn win_count(&self) -> &WinCount {
        &self.win_count
    }

    pub fn num_finished_layers(&self) -> usize {
        self.num_finished_layers
    }

    /// How many more registrations this pick can still hand out.
    pub fn n_reg_to_go(&self) -> i64 {
        self.remaining_request - self.request.n_reg() as i64
    }

    pub fn info(&self) -> String {
        format!(
            "layers: {}, done: {}/{}, wr: {:.3} ({} wins), stuck: {}",
            self.num_finished_layers,
            self.num_request as i64 - self.remaining_request,
            self.num_request,
            self.win_count.winrate(),
            self.win_count.n_win(),
            self.win_count.n_stuck()
        )
    }

    fn set_new_request(&mut self) {
        let new_request = if self.remaining_request > 0 {
            zg_utils::min(self.max_request_per_layer, self.remaining_request as usize)
        } else {
            0
        };

        self.request = BatchRequest::new(new_request);
        if new_request > 0 {
            self.num_finished_layers += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_manager::tests::manual_timer;
    use crate::record::ThreadState;
    use std::sync::atomic::Ordering;

    fn heartbeat(mgr: &ClientManager, identity: &str) {
        mgr.update_states(identity, &[ThreadState::default()]);
    }

    #[test]
    fn register_then_add() {
        let mut pick = Pick::new(4, 4);

        assert_eq!(pick.reg("a"), RegisterResult::NewlyRegistered);
        assert_eq!(pick.reg("a"), RegisterResult::RegisteredWaiting);
        assert!(pick.reg("a").need_request());

        assert_eq!(pick.add("a", 1.0), AddResult::NewlyAdded);
        assert_eq!(pick.add("a", -1.0), AddResult::OverflowNotAdded);
        assert_eq!(pick.reg("a"), RegisterResult::RegisteredSettled);
        assert_eq!(pick.add("b", 1.0), AddResult::NotRegistered);
    }

    #[test]
    fn capacity_is_per_layer() {
        let mut pick = Pick::new(8, 2);

        assert_eq!(pick.reg("a"), RegisterResult::NewlyRegistered);
        assert_eq!(pick.reg("b"), RegisterResult::NewlyRegistered);
        assert_eq!(pick.reg("c"), RegisterResult::AtCapacity);
    }

    #[test]
    fn finished_layers_roll_up() {
        let (_, timer) = manual_timer();
        let mgr = ClientManager::new(100, 0.0, timer);
        let mut pick = Pick::new(4, 2);

        heartbeat(&mgr, "a");
        heartbeat(&mgr, "b");

        pick.reg("a");
        pick.reg("b");
        pick.add("a", 1.0);
        pick.add("b", -1.0);
        pick.check_stuck(&mgr);

        assert_eq!(pick.win_count().n_done(), 2);
        assert_eq!(pick.win_count().n_win(), 1);
        assert_eq!(pick.num_finished_layers(), 2);

        // the fresh layer accepts new registrations again
        assert_eq!(pick.reg("c"), RegisterResult::NewlyRegistered);
    }

    #[test]
    fn stuck_client_releases_its_slot() {
        let (clock, timer) = manual_timer();
        let mgr = ClientManager::new(10, 0.0, timer);
        let mut pick = Pick::new(2, 2);

        heartbeat(&mgr, "x");
        heartbeat(&mgr, "y");
        assert_eq!(pick.reg("x"), RegisterResult::NewlyRegistered);
        assert_eq!(pick.reg("y"), RegisterResult::NewlyRegistered);

        // y reports, x goes silent past the deadline
        pick.add("y", 1.0);
        clock.store(11, Ordering::Release);
        heartbeat(&mgr, "y");
        pick.check_stuck(&mgr);

        // the layer sealed with x stuck, and a fresh client inherits the
        // released slot in the next layer
        assert_eq!(pick.win_count().n_done(), 1);
        assert_eq!(pick.win_count().n_stuck(), 1);
        assert_eq!(pick.reg("z"), RegisterResult::NewlyRegistered);
    }

    #[test]
    fn revived_client_keeps_waiting() {
        let (clock, timer) = manual_timer();
        let mgr = ClientManager::new(10, 0.0, timer);
        let mut pick = Pick::new(2, 2);

        heartbeat(&mgr, "x");
        pick.reg("x");

        clock.store(11, Ordering::Release);
        heartbeat(&mgr, "x");
        pick.check_stuck(&mgr);

        // the heartbeat above revived x just in time
        assert_eq!(pick.win_count().n_stuck(), 0);
        assert_eq!(pick.reg("x"), RegisterResult::RegisteredWaiting);
    }

    #[test]
    fn n_reg_to_go_counts_down() {
        let mut pick = Pick::new(4, 4);

        assert_eq!(pick.n_reg_to_go(), 4);
        pick.reg("a");
        assert_eq!(pick.n_reg_to_go(), 3);
    }
}
