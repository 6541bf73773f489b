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

use crate::record::{ClientType, ThreadState};

/// What the server knows about one worker process.
#[derive(Clone, Debug)]
pub struct ClientInfo {
    pub identity: String,
    pub client_type: ClientType,
    pub seq: i64,
    pub active: bool,
    pub last_update: u64,
    pub max_delay_sec: u64,
    pub threads: HashMap<usize, ThreadState>
}

impl ClientInfo {
    fn new(identity: &str, client_type: ClientType, now: u64, max_delay_sec: u64) -> Self {
        Self {
            identity: identity.to_string(),
            client_type: client_type,
            seq: 0,
            active: true,
            last_update: now,
            max_delay_sec: max_delay_sec,
            threads: HashMap::new()
        }
    }

    pub fn just_allocated(&self) -> bool {
        self.seq == 0
    }

    /// Returns true if the client has been silent for longer than its
    /// allowance, together with the observed delay.
    ///
    /// # Arguments
    ///
    /// * `now` -
    ///
    pub fn is_stuck(&self, now: u64) -> (bool, u64) {
        let delay = now.saturating_sub(self.last_update);

        (delay >= self.max_delay_sec, delay)
    }
}

/// A clock the manager samples, injectable so liveness tests do not have
/// to sleep.
pub type Timer = Box<dyn Fn() -> u64 + Send + Sync>;

/// Tracks every client that ever polled, allocates worker types to keep
/// the configured mix, and flips clients between alive and dead based on
/// their heartbeats. Death is never final: a heartbeat revives.
pub struct ClientManager {
    state: Mutex<ManagerState>,
    max_delay_sec: u64,
    timer: Timer
}

struct ManagerState {
    clients: HashMap<String, ClientInfo>,
    selfplay_only_ratio: f32
}

impl ClientManager {
    /// # Arguments
    ///
    /// * `max_delay_sec` -
    /// * `selfplay_only_ratio` - share of clients kept on pure self-play
    /// * `timer` - usually the wall clock
    ///
    pub fn new(max_delay_sec: u64, selfplay_only_ratio: f32, timer: Timer) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                clients: HashMap::new(),
                selfplay_only_ratio: selfplay_only_ratio
            }),
            max_delay_sec: max_delay_sec,
            timer: timer
        }
    }

    pub fn now(&self) -> u64 {
        (self.timer)()
    }

    pub fn set_selfplay_only_ratio(&self, ratio: f32) {
        let mut state = self.state.lock().expect("could not acquire client lock");

        state.selfplay_only_ratio = ratio;
    }

    /// Digest a batch of heartbeats from `identity`, reviving or
    /// registering it as needed, then refresh everyone's liveness.
    ///
    /// # Arguments
    ///
    /// * `identity` -
    /// * `states` -
    ///
    pub fn update_states(&self, identity: &str, states: &[ThreadState]) -> ClientInfo {
        let now = self.now();
        let mut state = self.state.lock().expect("could not acquire client lock");

        state.get_or_create(identity, now, self.max_delay_sec);

        {
            let info = state.clients.get_mut(identity).expect("client was just created");

            info.last_update = now;
            for thread_state in states {
                info.threads.insert(thread_state.thread_id, *thread_state);
            }
        }

        state.update_clients(now);
        state.clients[identity].clone()
    }

    /// Look a client up, registering it on first contact.
    ///
    /// # Arguments
    ///
    /// * `identity` -
    ///
    pub fn get_client(&self, identity: &str) -> ClientInfo {
        let now = self.now();
        let mut state = self.state.lock().expect("could not acquire client lock");

        state.get_or_create(identity, now, self.max_delay_sec);
        state.clients[identity].clone()
    }

    /// Look a client up without registering it.
    ///
    /// # Arguments
    ///
    /// * `identity` -
    ///
    pub fn get_client_if_known(&self, identity: &str) -> Option<ClientInfo> {
        let state = self.state.lock().expect("could not acquire client lock");

        state.clients.get(identity).cloned()
    }

    /// Bump the sequence number after a reply went out.
    ///
    /// # Arguments
    ///
    /// * `identity` -
    ///
    pub fn inc_seq(&self, identity: &str) {
        let mut state = self.state.lock().expect("could not acquire client lock");

        if let Some(info) = state.clients.get_mut(identity) {
            info.seq += 1;
        }
    }

    /// Re-derive everyone's alive flag from the clock.
    pub fn update_clients(&self) {
        let now = self.now();
        let mut state = self.state.lock().expect("could not acquire client lock");

        state.update_clients(now);
    }

    pub fn num_clients(&self) -> usize {
        self.state.lock().expect("could not acquire client lock").clients.len()
    }

    /// The number of eval-capable clients the evaluation controller can
    /// plan with.
    pub fn expected_num_eval(&self) -> usize {
        let state = self.state.lock().expect("could not acquire client lock");

        state.clients.values()
            .filter(|c| c.active && c.client_type == ClientType::EvalThenSelfplay)
            .count()
    }
}

impl ManagerState {
    fn get_or_create(&mut self, identity: &str, now: u64, max_delay_sec: u64) {
        if self.clients.contains_key(identity) {
            return;
        }

        let client_type = self.alloc_type();

        info!("new client {} as {:?}", identity, client_type);
        self.clients.insert(
            identity.to_string(),
            ClientInfo::new(identity, client_type, now, max_delay_sec)
        );
    }

    /// Keep roughly `selfplay_only_ratio` of the active clients on pure
    /// self-play, the rest run evaluations first.
    fn alloc_type(&self) -> ClientType {
        let active = self.clients.values().filter(|c| c.active).count();
        let selfplay_only = self.clients.values()
            .filter(|c| c.active && c.client_type == ClientType::SelfplayOnly)
            .count();

        if (selfplay_only as f32) < self.selfplay_only_ratio * (active + 1) as f32 {
            ClientType::SelfplayOnly
        } else {
            ClientType::EvalThenSelfplay
        }
    }

    fn update_clients(&mut self, now: u64) {
        let mut newly_dead = 0;
        let mut newly_alive = 0;

        for info in self.clients.values_mut() {
            let (stuck, delay) = info.is_stuck(now);

            if info.active && stuck {
                info.active = false;
                newly_dead += 1;
                warn!("client {} is dead after {}s of silence", info.identity, delay);
            } else if !info.active && !stuck {
                info.active = true;
                newly_alive += 1;
                info!("client {} came back", info.identity);
            }
        }

        if newly_dead + newly_alive > 0 {
            info!("liveness sweep: {} newly dead, {} newly alive", newly_dead, newly_alive);
        }
    }
}
