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

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::actor::{ActorParams, BatchActor, EvalBatcher};
use crate::dispatcher::{GameMailbox, ThreadedDispatcher};
use crate::options::GameOptions;
use crate::record::{
    moves_to_string, GameResult, Record, Records, Request, RequestSeq, RestartReply, SparsePolicy,
    ThreadState
};
use crate::resign::ResignCheck;
use crate::transport::ClientChannel;
use zg_go::{Board, Color, Vertex, MAX_PLY};
use zg_mcts::base::GameAction;
use zg_mcts::options::{CtrlOptions, PickMethod};
use zg_mcts::MctsAi;

/// Why a game ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishReason {
    Resign,
    TwoPasses,
    MaxStep,
    Illegal
}

/// The record batch a worker accumulates between flushes, shared between
/// its game threads and the writer thread.
pub struct GuardedRecords {
    records: Mutex<Records>
}

impl GuardedRecords {
    pub fn new(identity: &str) -> Self {
        Self {
            records: Mutex::new(Records::new(identity))
        }
    }

    pub fn feed(&self, record: Record) {
        self.records.lock().expect("could not acquire record lock").records.push(record);
    }

    pub fn update_state(&self, state: ThreadState) {
        self.records.lock().expect("could not acquire record lock").update_state(state);
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("could not acquire record lock").records.len()
    }

    /// Take everything accumulated so far, leaving an empty batch behind.
    pub fn dump_and_clear(&self) -> Records {
        let mut records = self.records.lock().expect("could not acquire record lock");
        let out = records.clone();

        records.clear();
        out
    }
}

/// One game thread: owns the board, one or two engines, and the
/// request/restart state machine.
pub struct GameSelfPlay {
    game_idx: usize,
    options: GameOptions,
    batcher: EvalBatcher,
    mailbox: GameMailbox,
    records: Arc<GuardedRecords>,
    rng: SmallRng,

    board: Board,
    seq: usize,
    curr_request: Request,
    mcts_policies: Vec<SparsePolicy>,
    predicted_values: Vec<f32>,
    resign_check: ResignCheck,
    used_models: Arc<Mutex<BTreeSet<i64>>>,
    required_black: Arc<AtomicI64>,
    required_white: Arc<AtomicI64>,

    ai: Option<MctsAi<BatchActor>>,
    ai2: Option<MctsAi<BatchActor>>,

    online_counter: usize,
    move_rank_histogram: [usize; 4]
}

impl GameSelfPlay {
    /// # Arguments
    ///
    /// * `game_idx` -
    /// * `options` -
    /// * `batcher` -
    /// * `mailbox` -
    /// * `records` -
    /// * `seed` -
    ///
    pub fn new(
        game_idx: usize,
        options: GameOptions,
        batcher: EvalBatcher,
        mailbox: GameMailbox,
        records: Arc<GuardedRecords>,
        seed: u64
    ) -> Self {
        let resign_check = ResignCheck::new(
            options.resign_thres as f32,
            options.never_resign_prob
        );
        let komi = options.komi;

        Self {
            game_idx: game_idx,
            options: options,
            batcher: batcher,
            mailbox: mailbox,
            records: records,
            rng: SmallRng::seed_from_u64(seed),
            board: Board::new(komi),
            seq: 0,
            curr_request: Request::wait(),
            mcts_policies: vec! [],
            predicted_values: vec! [],
            resign_check: resign_check,
            used_models: Arc::new(Mutex::new(BTreeSet::new())),
            required_black: Arc::new(AtomicI64::new(-1)),
            required_white: Arc::new(AtomicI64::new(-1)),
            ai: None,
            ai2: None,
            online_counter: 0,
            move_rank_histogram: [0; 4]
        }
    }

    pub fn seq(&self) -> usize {
        self.seq
    }

    /// Returns false once this thread has played its per-thread game
    /// budget.
    pub fn finished(&self) -> bool {
        self.options.num_games_per_thread > 0
            && self.seq as i64 >= self.options.num_games_per_thread
    }

    /// Play one move (or idle when waiting). The poll cadence, the restart
    /// protocol and the game bookkeeping all hang off this.
    pub fn act(&mut self) {
        if self.online_counter % 5 == 0 || self.curr_request.vers.wait() {
            self.poll_dispatcher();
        }
        self.online_counter += 1;

        if self.curr_request.vers.wait() {
            thread::sleep(Duration::from_millis(self.options.poll_interval_ms));
            return;
        }
        if self.ai.is_none() {
            self.restart();
        }

        let to_move = Board::to_move(&self.board);
        let is_selfplay = self.curr_request.vers.is_selfplay();
        let diverse = is_selfplay && self.board.ply() <= self.options.policy_distri_cutoff;
        let use_second_engine = self.ai2.is_some() && to_move == Color::White;
        let policy_only = if to_move == Color::Black {
            self.options.black_use_policy_network_only
        } else {
            self.options.white_use_policy_network_only
        };

        // run the search with whichever engine owns this color
        let outcome = {
            let board = &self.board;
            let white_ctrl = CtrlOptions {
                rollouts_per_thread: self.options.white_rollouts_per_thread
            };
            let ai = match (&mut self.ai, &mut self.ai2) {
                (_, Some(ai2)) if to_move == Color::White => ai2,
                (Some(ai), _) => ai,
                _ => return
            };

            if use_second_engine {
                // the second engine may search a reduced budget
                ai.set_ctrl(&white_ctrl);
            }

            let chosen = if policy_only {
                ai.act_policy_only(board)
            } else {
                ai.act(board)
            };

            match chosen {
                Ok(action) => {
                    let mut action = action;
                    let policy = ai.mcts_policy();

                    if diverse {
                        if let Some(sampled) = policy.sample(&mut self.rng) {
                            action = sampled;
                        }
                    }

                    let rank = ai.last_result()
                        .and_then(|result| result.rank_of(action, PickMethod::StrongestPrior));

                    Some((action, ai.value(), policy, rank))
                },
                Err(e) => {
                    warn!("[{}] search failed: {}", self.game_idx, e);
                    None
                }
            }
        };

        let (action, value, policy, rank) = match outcome {
            Some(outcome) => outcome,
            None => {
                // a failed engine (usually a model mismatch) starts a
                // fresh session with the current request
                self.restart();
                return;
            }
        };

        if diverse {
            self.mcts_policies.push(SparsePolicy::quantize(
                &policy.entries.iter()
                    .map(|&(action, w)| (action.policy_index(), w))
                    .collect::<Vec<_>>()
            ));
        }
        if let Some(rank) = rank {
            // how far down the prior ordering the played move sat
            self.move_rank_histogram[zg_utils::min(rank, 3)] += 1;
        }
        self.predicted_values.push(value);

        // the value is from black's view, the resign decision from the
        // mover's
        let my_value = if to_move == Color::Black { value } else { -value };

        if self.resign_check.check(my_value) {
            self.finish_game(FinishReason::Resign);
            return;
        }

        if !self.board.place(action) {
            warn!("[{}] engine chose the illegal move {}", self.game_idx, action);
            self.finish_game(FinishReason::Illegal);
            return;
        }

        // keep the acting engine's subtree under the played move
        self.advance_engine(use_second_engine, action);

        if self.board.terminated() {
            let reason = if self.board.ply() >= MAX_PLY {
                FinishReason::MaxStep
            } else {
                FinishReason::TwoPasses
            };

            self.finish_game(reason);
        }
    }

    /// Check the dispatcher for request changes, without ever blocking:
    /// a waiting thread polls again on its next `act`.
    fn poll_dispatcher(&mut self) {
        let curr = self.curr_request.clone();
        let mut received = None;

        self.mailbox.check_message(false, |request| {
            let reply = restart_decision(&curr, request);

            received = Some((request.clone(), reply));
            reply
        });

        if let Some((request, reply)) = received {
            self.curr_request = request;
            self.resign_check.resign_thres = self.curr_request.resign_thres;
            self.resign_check.never_resign_prob = self.curr_request.never_resign_prob;

            match reply {
                RestartReply::UpdateModel => {
                    self.restart();
                },
                RestartReply::UpdateModelAsync => {
                    self.set_async();
                },
                _ => {}
            }
        }

        self.records.update_state(self.thread_state());
    }

    /// Tear the engines down and build them for the current request.
    fn restart(&mut self) {
        let request = self.curr_request.clone();

        if request.vers.wait() {
            self.ai = None;
            self.ai2 = None;
            return;
        }

        let async_mode = request.async_mode;

        self.required_black.store(
            if async_mode { -1 } else { request.vers.black_ver },
            Ordering::Release
        );

        let required_black = self.required_black.clone();

        self.ai = Some(self.make_engine("actor_black", &request, required_black));

        if request.vers.white_ver >= 0 {
            self.required_white.store(
                if async_mode { -1 } else { request.vers.white_ver },
                Ordering::Release
            );

            let required_white = self.required_white.clone();

            self.ai2 = Some(self.make_engine("actor_white", &request, required_white));

            if request.player_swap {
                std::mem::swap(&mut self.ai, &mut self.ai2);
            }
        } else {
            self.ai2 = None;
        }

        self.new_game();
    }

    /// Accept replies from any model from now on, keeping the game going.
    fn set_async(&mut self) {
        self.required_black.store(-1, Ordering::Release);
        self.required_white.store(-1, Ordering::Release);
        self.add_current_models();
    }

    fn make_engine(
        &mut self,
        name: &str,
        request: &Request,
        required: Arc<AtomicI64>
    ) -> MctsAi<BatchActor> {
        let mut search_options = request.vers.mcts_opt.clone();

        search_options.seed = self.rng.gen();

        let params = ActorParams {
            name: name.to_string(),
            komi: self.options.komi,
            ply_pass_enabled: self.options.ply_pass_enabled
        };
        let batcher = self.batcher.clone();
        let used_models = self.used_models.clone();

        MctsAi::new(search_options, move |_| {
            BatchActor::new(params.clone(), batcher.clone(), required.clone(), used_models.clone())
        })
    }

    fn advance_engine(&mut self, second_engine: bool, action: Vertex) {
        let ai = if second_engine { &mut self.ai2 } else { &mut self.ai };

        if let Some(ai) = ai {
            ai.forward(action);
        }
    }

    fn new_game(&mut self) {
        self.board = Board::new(self.options.komi);
        self.mcts_policies.clear();
        self.predicted_values.clear();
        self.move_rank_histogram = [0; 4];
        self.used_models.lock().expect("could not acquire used models lock").clear();
        self.add_current_models();
        self.resign_check.reset(&mut self.rng);
        self.seq += 1;

        if let Some(ai) = &mut self.ai {
            ai.end_game();
        }
        if let Some(ai2) = &mut self.ai2 {
            ai2.end_game();
        }
    }

    fn add_current_models(&self) {
        let mut used = self.used_models.lock().expect("could not acquire used models lock");

        if self.curr_request.vers.black_ver >= 0 {
            used.insert(self.curr_request.vers.black_ver);
        }
        if self.curr_request.vers.white_ver >= 0 {
            used.insert(self.curr_request.vers.white_ver);
        }
    }

    fn finish_game(&mut self, reason: FinishReason) {
        let final_value = match reason {
            FinishReason::Resign => {
                // the player to move gave up
                if Board::to_move(&self.board) == Color::Black { -1.0 } else { 1.0 }
            },
            _ => self.board.evaluate()
        };

        debug!(
            "[{}] game {} over: {:?}, value {}, {} moves, move ranks {:?}",
            self.game_idx, self.seq, reason, final_value, self.board.ply(),
            self.move_rank_histogram
        );

        let record = self.dump_record(final_value);

        self.records.feed(record);
        self.records.update_state(self.thread_state());
        self.new_game();
    }

    fn dump_record(&self, final_value: f32) -> Record {
        Record {
            timestamp: zg_utils::sec_since_epoch(),
            thread_id: self.game_idx,
            seq: self.seq,
            request: self.curr_request.clone(),
            result: GameResult {
                reward: final_value,
                content: moves_to_string(self.board.moves()),
                using_models: self.used_models.lock()
                    .expect("could not acquire used models lock")
                    .iter().cloned().collect(),
                policies: self.mcts_policies.clone(),
                values: self.predicted_values.clone(),
                num_moves: self.board.ply(),
                black_never_resign: self.resign_check.never_resign,
                white_never_resign: self.resign_check.never_resign
            }
        }
    }

    fn thread_state(&self) -> ThreadState {
        ThreadState {
            thread_id: self.game_idx,
            seq: self.seq,
            move_idx: self.board.ply(),
            black_ver: self.curr_request.vers.black_ver,
            white_ver: self.curr_request.vers.white_ver
        }
    }
}

/// Decide how a game thread reacts to a request broadcast, given what it
/// is currently playing.
pub fn restart_decision(curr: &Request, incoming: &Request) -> RestartReply {
    let is_waiting = incoming.vers.wait();
    let is_prev_waiting = curr.vers.wait();
    let same_vers = incoming.vers == curr.vers;
    let same_swap = incoming.player_swap == curr.player_swap;
    let async_mode = incoming.async_mode;
    let no_restart = (same_vers || async_mode) && same_swap && !is_prev_waiting;

    if is_waiting {
        RestartReply::OnlyWait
    } else if !no_restart {
        RestartReply::UpdateModel
    } else if !async_mode || same_vers {
        RestartReply::UpdateRequestOnly
    } else {
        RestartReply::UpdateModelAsync
    }
}

/// A worker process: `num_games` game threads sharing one evaluator
/// rendezvous, a dispatcher, and a writer thread that polls the server.
pub struct Client {
    dispatcher: Arc<ThreadedDispatcher>,
    records: Arc<GuardedRecords>,
    done: Arc<AtomicBool>,
    game_threads: Vec<JoinHandle<()>>,
    writer_thread: Option<JoinHandle<()>>
}

impl Client {
    /// Stand the worker up and connect it to `server_addr`.
    ///
    /// # Arguments
    ///
    /// * `identity` -
    /// * `server_addr` -
    /// * `options` -
    /// * `batcher` -
    /// * `num_games` -
    ///
    pub fn new(
        identity: &str,
        server_addr: &str,
        options: GameOptions,
        batcher: EvalBatcher,
        num_games: usize
    ) -> Self {
        let records = Arc::new(GuardedRecords::new(identity));
        let (dispatcher, mailboxes) = ThreadedDispatcher::new(
            num_games,
            options.poll_interval_ms,
            Box::new(|vers| { info!("session started with {}", vers); })
        );
        let dispatcher = Arc::new(dispatcher);
        let done = Arc::new(AtomicBool::new(false));

        let game_threads = mailboxes.into_iter().enumerate().map(|(game_idx, mailbox)| {
            let mut game = GameSelfPlay::new(
                game_idx,
                options.clone(),
                batcher.clone(),
                mailbox,
                records.clone(),
                zg_utils::sec_since_epoch().wrapping_add(game_idx as u64)
            );
            let done = done.clone();

            thread::Builder::new()
                .name(format!("game_{}", game_idx))
                .spawn(move || {
                    while !done.load(Ordering::Acquire) && !game.finished() {
                        game.act();
                    }
                })
                .expect("could not spawn game thread")
        }).collect();

        let writer_thread = {
            let records = records.clone();
            let dispatcher = dispatcher.clone();
            let done = done.clone();
            let addr = server_addr.to_string();
            let poll_ms = options.poll_interval_ms;

            thread::Builder::new()
                .name("writer_ctrl".into())
                .spawn(move || writer_loop(addr, records, dispatcher, done, poll_ms))
                .expect("could not spawn writer thread")
        };

        Self {
            dispatcher: dispatcher,
            records: records,
            done: done,
            game_threads: game_threads,
            writer_thread: Some(writer_thread)
        }
    }

    pub fn records(&self) -> &Arc<GuardedRecords> {
        &self.records
    }

    /// Inject a request locally, bypassing the server. Used by standalone
    /// runs and tests.
    ///
    /// # Arguments
    ///
    /// * `request` -
    ///
    pub fn set_request(&self, request: Request) {
        self.dispatcher.send_to_thread(request);
    }

    pub fn stop(mut self) {
        self.done.store(true, Ordering::Release);

        for handle in self.game_threads.drain(..) {
            handle.join().expect("could not join game thread");
        }
        if let Some(handle) = self.writer_thread.take() {
            handle.join().expect("could not join writer thread");
        }
        self.dispatcher.stop();
    }
}

/// Ship accumulated records on a fixed cadence, forwarding each reply's
/// request to the dispatcher.
fn writer_loop(
    addr: String,
    records: Arc<GuardedRecords>,
    dispatcher: Arc<ThreadedDispatcher>,
    done: Arc<AtomicBool>,
    poll_ms: u64
) {
    let mut channel = ClientChannel::new(&addr);
    let mut expected_seq = 0i64;

    while !done.load(Ordering::Acquire) {
        let payload = records.dump_and_clear();

        match channel.exchange(&payload) {
            Ok(RequestSeq { request, seq }) => {
                if seq != expected_seq {
                    debug!("sequence number jumped from {} to {}", expected_seq, seq);
                }
                expected_seq = seq + 1;
                dispatcher.send_to_thread(request);
            },
            Err(e) => {
                debug!("poll failed: {}", e);
            }
        }

        thread::sleep(Duration::from_millis(poll_ms));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::make_extractor;
    use crate::record::ModelPair;
    use zg_batch::{BatchOptions, Batcher, RandomEvaluator};
    use zg_mcts::options::{PickMethod, SearchOptions};

    fn tiny_mcts_options() -> SearchOptions {
        SearchOptions {
            num_threads: 1,
            num_rollouts_per_thread: 4,
            num_rollouts_per_batch: 2,
            virtual_loss: 1.0,
            root_epsilon: 0.0,
            root_alpha: 0.03,
            persistent_tree: true,
            pick_method: PickMethod::MostVisited,
            seed: 1,
            alg: Default::default()
        }
    }

    fn selfplay_request(ver: i64) -> Request {
        Request {
            vers: ModelPair {
                black_ver: ver,
                white_ver: -1,
                mcts_opt: tiny_mcts_options()
            },
            ..Default::default()
        }
    }

    fn game_fixture(version: i64) -> (GameSelfPlay, EvalBatcher, zg_batch::ServiceHandle, Arc<GuardedRecords>, ThreadedDispatcher) {
        let batcher = Batcher::new(make_extractor(), BatchOptions {
            label: "client_test".to_string(),
            min_batch: 1,
            max_batch: 8,
            timeout_us: 2_000_000
        });
        let service = batcher.spawn_service(RandomEvaluator { version });
        let records = Arc::new(GuardedRecords::new("test-client"));
        let (dispatcher, mut mailboxes) = ThreadedDispatcher::new(1, 2, Box::new(|_| {}));
        let game = GameSelfPlay::new(
            0,
            GameOptions {
                never_resign_prob: 1.0,
                // the second engine of an evaluation match runs shallow
                white_rollouts_per_thread: 1,
                ..GameOptions::for_tests()
            },
            batcher.clone(),
            mailboxes.pop().unwrap(),
            records.clone(),
            12345
        );

        (game, batcher, service, records, dispatcher)
    }

    #[test]
    fn restart_decision_table() {
        let selfplay_3 = selfplay_request(3);
        let mut wait = Request::wait();

        // a wait order only parks the thread
        assert_eq!(restart_decision(&selfplay_3, &wait), RestartReply::OnlyWait);

        // first actionable request after waiting restarts
        assert_eq!(restart_decision(&wait, &selfplay_3), RestartReply::UpdateModel);

        // the same session again is a plain refresh
        assert_eq!(restart_decision(&selfplay_3, &selfplay_3), RestartReply::UpdateRequestOnly);

        // a new version forces a restart
        assert_eq!(
            restart_decision(&selfplay_3, &selfplay_request(4)),
            RestartReply::UpdateModel
        );

        // unless the session runs async, which keeps the game alive
        let mut async_4 = selfplay_request(4);

        async_4.async_mode = true;
        assert_eq!(
            restart_decision(&selfplay_3, &async_4),
            RestartReply::UpdateModelAsync
        );

        // a side swap always restarts
        let mut swapped = selfplay_request(3);

        swapped.player_swap = true;
        assert_eq!(restart_decision(&selfplay_3, &swapped), RestartReply::UpdateModel);

        wait.vers.black_ver = -1;
        assert_eq!(restart_decision(&selfplay_3, &wait), RestartReply::OnlyWait);
    }

    #[test]
    fn plays_a_game_to_completion() {
        let (mut game, batcher, service, records, dispatcher) = game_fixture(2);

        dispatcher.send_to_thread(selfplay_request(2));

        let mut guard = 0;

        while records.len() == 0 && guard < 10_000 {
            game.act();
            guard += 1;
        }

        let payload = records.dump_and_clear();

        assert_eq!(payload.records.len(), 1, "no game finished after {} acts", guard);

        let record = &payload.records[0];

        assert_eq!(record.request.vers.black_ver, 2);
        assert_eq!(record.result.using_models, vec! [2]);
        assert!(record.result.num_moves > 0);
        assert_eq!(record.result.values.len() as usize, record.result.num_moves);
        assert!(record.result.reward == 1.0 || record.result.reward == -1.0 || record.result.reward == 0.0);

        dispatcher.stop();
        batcher.shutdown();
        service.join();
    }

    #[test]
    fn evaluation_games_use_two_engines() {
        let (mut game, batcher, service, records, dispatcher) = game_fixture(5);
        let mut request = selfplay_request(5);

        request.vers.white_ver = 5;
        dispatcher.send_to_thread(request);

        let mut guard = 0;

        while records.len() == 0 && guard < 10_000 {
            game.act();
            guard += 1;
        }

        assert!(game.ai.is_some());
        assert!(game.ai2.is_some());

        let payload = records.dump_and_clear();

        assert_eq!(payload.records[0].result.using_models, vec! [5]);

        dispatcher.stop();
        batcher.shutdown();
        service.join();
    }

    #[test]
    fn thread_state_tracks_the_game() {
        let (mut game, batcher, service, _records, dispatcher) = game_fixture(1);

        dispatcher.send_to_thread(selfplay_request(1));

        // one poll plus a couple of moves
        for _ in 0..8 {
            game.act();
        }

        let state = game.thread_state();

        assert_eq!(state.thread_id, 0);
        assert_eq!(state.black_ver, 1);
        assert_eq!(state.white_ver, -1);

        dispatcher.stop();
        batcher.shutdown();
        service.join();
    }
}
