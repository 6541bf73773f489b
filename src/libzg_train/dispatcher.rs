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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::record::{ModelPair, Request, RestartReply};

/// Called with the new model pair once at least one game thread decided to
/// restart its engines for it.
pub type GameStartFn = Box<dyn Fn(&ModelPair) + Send + Sync>;

struct GameEndpoint {
    request_tx: Sender<Request>,
    complete_tx: Sender<()>
}

/// One game thread's view of the dispatcher.
pub struct GameMailbox {
    game_idx: usize,
    request_rx: Receiver<Request>,
    confirm_tx: Sender<(usize, RestartReply)>,
    complete_rx: Receiver<()>
}

impl GameMailbox {
    pub fn game_idx(&self) -> usize {
        self.game_idx
    }

    /// Poll for a broadcast request. With `wait` the call blocks until one
    /// arrives. `on_receive` inspects the request and decides the restart
    /// reply; a thread that asked for `UpdateModel` then blocks until the
    /// dispatcher confirms the new session.
    ///
    /// # Arguments
    ///
    /// * `wait` -
    /// * `on_receive` -
    ///
    pub fn check_message<F>(&self, wait: bool, on_receive: F) -> Option<RestartReply>
        where F: FnOnce(&Request) -> RestartReply
    {
        let request = if wait {
            self.request_rx.recv().ok()?
        } else {
            self.request_rx.try_recv().ok()?
        };

        let reply = on_receive(&request);

        self.confirm_tx.send((self.game_idx, reply)).ok();

        if reply == RestartReply::UpdateModel {
            // wait for every sibling to agree before entering the session,
            // bounded so a sibling that already finished its game budget
            // cannot park us forever
            self.complete_rx.recv_timeout(Duration::from_secs(10)).ok();
        }
        Some(reply)
    }
}

/// The worker-side request fan-out: a background thread drains the inbound
/// mailbox on a fixed cadence, broadcasts request changes to every game
/// thread, gathers their restart verdicts, and reports upward when a new
/// model session begins.
pub struct ThreadedDispatcher {
    inbox_tx: Sender<Request>,
    done: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>
}

impl ThreadedDispatcher {
    /// Create the dispatcher and one mailbox per game thread.
    ///
    /// # Arguments
    ///
    /// * `num_games` -
    /// * `poll_interval_ms` -
    /// * `on_game_start` -
    ///
    pub fn new(
        num_games: usize,
        poll_interval_ms: u64,
        on_game_start: GameStartFn
    ) -> (Self, Vec<GameMailbox>) {
        let (inbox_tx, inbox_rx) = unbounded();
        let (confirm_tx, confirm_rx) = unbounded();
        let mut endpoints = Vec::with_capacity(num_games);
        let mut mailboxes = Vec::with_capacity(num_games);

        for game_idx in 0..num_games {
            let (request_tx, request_rx) = unbounded();
            let (complete_tx, complete_rx) = unbounded();

            endpoints.push(GameEndpoint { request_tx, complete_tx });
            mailboxes.push(GameMailbox {
                game_idx: game_idx,
                request_rx: request_rx,
                confirm_tx: confirm_tx.clone(),
                complete_rx: complete_rx
            });
        }

        let done = Arc::new(AtomicBool::new(false));
        let worker_done = done.clone();
        let handle = thread::Builder::new()
            .name("dispatcher".into())
            .spawn(move || {
                dispatch_loop(
                    inbox_rx,
                    confirm_rx,
                    endpoints,
                    on_game_start,
                    poll_interval_ms,
                    worker_done
                )
            })
            .expect("could not spawn dispatcher thread");

        let out = Self {
            inbox_tx: inbox_tx,
            done: done,
            handle: Mutex::new(Some(handle))
        };

        (out, mailboxes)
    }

    /// Queue a request for broadcast. Identical consecutive requests are
    /// collapsed by the dispatch loop.
    ///
    /// # Arguments
    ///
    /// * `request` -
    ///
    pub fn send_to_thread(&self, request: Request) {
        self.inbox_tx.send(request).ok();
    }

    pub fn stop(&self) {
        self.done.store(true, Ordering::Release);

        if let Some(handle) = self.handle.lock().expect("could not acquire dispatcher lock").take() {
            handle.join().expect("could not join dispatcher thread");
        }
    }
}

impl Drop for ThreadedDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop(
    inbox_rx: Receiver<Request>,
    confirm_rx: Receiver<(usize, RestartReply)>,
    endpoints: Vec<GameEndpoint>,
    on_game_start: GameStartFn,
    poll_interval_ms: u64,
    done: Arc<AtomicBool>
) {
    let mut curr_request: Option<Request> = None;

    while !done.load(Ordering::Acquire) {
        let request = match inbox_rx.recv_timeout(Duration::from_millis(poll_interval_ms)) {
            Ok(request) => request,
            Err(_) => continue
        };

        if curr_request.as_ref() == Some(&request) {
            continue;
        }

        info!(
            "dispatching {} (swap={}, async={})",
            request.vers, request.player_swap, request.async_mode
        );
        curr_request = Some(request.clone());
        process_request(&request, &confirm_rx, &endpoints, &on_game_start, &done);
    }
}

fn process_request(
    request: &Request,
    confirm_rx: &Receiver<(usize, RestartReply)>,
    endpoints: &[GameEndpoint],
    on_game_start: &GameStartFn,
    done: &AtomicBool
) {
    // threads beyond the requested count receive a wait order instead
    let num_used = if request.num_game_thread_used < 0 {
        endpoints.len()
    } else {
        zg_utils::min(request.num_game_thread_used as usize, endpoints.len())
    };

    for (game_idx, endpoint) in endpoints.iter().enumerate() {
        let outgoing = if game_idx < num_used {
            request.clone()
        } else {
            Request::wait()
        };

        endpoint.request_tx.send(outgoing).ok();
    }

    let mut to_complete = vec! [];
    let mut update_model = false;
    let mut confirmed = 0;

    while confirmed < endpoints.len() && !done.load(Ordering::Acquire) {
        let (game_idx, reply) = match confirm_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(confirm) => confirm,
            Err(_) => continue
        };

        confirmed += 1;
        match reply {
            RestartReply::UpdateModel => {
                to_complete.push(game_idx);
                update_model = true;
            },
            RestartReply::UpdateModelAsync => {
                update_model = true;
            },
            _ => {}
        }
    }

    if update_model {
        info!(
            "game start: {} ({} threads restarting)",
            request.vers,
            to_complete.len()
        );
        on_game_start(&request.vers);
    }

    for game_idx in to_complete {
        endpoints[game_idx].complete_tx.send(()).ok();
    }
}
