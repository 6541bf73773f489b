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

use crossbeam_channel::{unbounded, Receiver, Sender};
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::base::{Actor, EvalError, GameState, SearchError};
use crate::options::{PickMethod, SearchOptions};
use crate::result::{EdgeSnapshot, MctsResult};
use crate::tree::{Node, SearchTree};
use zg_utils::sync::{Counter, Notif};

type ActionOf<E> = <<E as Actor>::State as GameState>::Action;

/// One root-to-leaf descent: the `(node, action)` pairs that were followed,
/// and the leaf the descent stopped at.
struct Traj<S: GameState> {
    path: Vec<(Arc<Node<S>>, S::Action)>,
    leaf: Arc<Node<S>>
}

/// State shared between the engine handle and its worker threads.
struct Shared<S: GameState> {
    tree: SearchTree<S>,
    options: SearchOptions,
    done: Notif,
    abort_run: AtomicBool,
    tree_ready: Counter,
    failure: Mutex<Option<EvalError>>
}

/// The batched, virtual-loss MCTS engine. It owns `num_threads` worker
/// threads that stay parked between searches, and one extra actor for the
/// odd main-thread evaluation.
pub struct TreeSearch<E: Actor> {
    shared: Arc<Shared<E::State>>,
    options: SearchOptions,
    ready: Vec<Sender<usize>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    main_actor: Mutex<E>,
    rng: Mutex<SmallRng>,
    stopped: AtomicBool
}

impl<E: Actor> TreeSearch<E> {
    /// Spawn the worker pool. `actor_gen` is called once per worker thread
    /// (and once more for the engine itself).
    ///
    /// # Arguments
    ///
    /// * `options` -
    /// * `actor_gen` -
    ///
    pub fn new<F: FnMut(usize) -> E>(options: SearchOptions, mut actor_gen: F) -> Self {
        let shared = Arc::new(Shared {
            tree: SearchTree::new(),
            options: options.clone(),
            done: Notif::new(),
            abort_run: AtomicBool::new(false),
            tree_ready: Counter::new(),
            failure: Mutex::new(None)
        });

        let mut ready = Vec::with_capacity(options.num_threads);
        let mut handles = Vec::with_capacity(options.num_threads);

        for thread_id in 0..options.num_threads {
            let (tx, rx) = unbounded();
            let shared = shared.clone();
            let actor = actor_gen(thread_id);

            handles.push(
                thread::Builder::new()
                    .name(format!("search_worker_{}", thread_id))
                    .spawn(move || worker_loop(thread_id, shared, actor, rx))
                    .expect("could not spawn search worker")
            );
            ready.push(tx);
        }

        let main_actor = actor_gen(options.num_threads);
        let seed = options.seed.wrapping_add(0x9e37_79b9_7f4a_7c15);

        Self {
            shared: shared,
            options: options,
            ready: ready,
            handles: Mutex::new(handles),
            main_actor: Mutex::new(main_actor),
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
            stopped: AtomicBool::new(false)
        }
    }

    pub fn options(&self) -> &SearchOptions {
        &self.options
    }

    pub fn tree(&self) -> &SearchTree<E::State> {
        &self.shared.tree
    }

    /// Run a full search from `root_state` with the configured rollout
    /// budget.
    ///
    /// # Arguments
    ///
    /// * `root_state` -
    ///
    pub fn run(&self, root_state: &E::State) -> Result<MctsResult<ActionOf<E>>, SearchError> {
        self.run_with(root_state, self.options.num_rollouts_per_thread)
    }

    /// Run a full search with an explicit per-thread rollout budget. With a
    /// budget of zero only the root is evaluated and the result carries the
    /// priors as its policy.
    ///
    /// # Arguments
    ///
    /// * `root_state` -
    /// * `rollouts_per_thread` -
    ///
    pub fn run_with(
        &self,
        root_state: &E::State,
        rollouts_per_thread: usize
    ) -> Result<MctsResult<ActionOf<E>>, SearchError> {
        self.set_root_state(root_state)?;

        let root = self.shared.tree.root();

        self.ensure_root_evaluated(&root)?;

        if self.options.root_epsilon > 0.0 {
            let mut rng = self.rng.lock().expect("could not acquire rng lock");

            root.enhance_exploration(self.options.root_epsilon, self.options.root_alpha, &mut *rng);
        }

        *self.shared.failure.lock().expect("could not acquire failure lock") = None;
        self.shared.abort_run.store(false, Ordering::Release);

        if rollouts_per_thread > 0 && !self.ready.is_empty() {
            for tx in &self.ready {
                tx.send(rollouts_per_thread).expect("search worker is gone");
            }

            self.shared.tree_ready.wait_until(self.ready.len());
            self.shared.tree_ready.reset();
        }

        let failure = self.shared.failure.lock().expect("could not acquire failure lock").take();

        match failure {
            Some(e) => Err(SearchError::Evaluator(e)),
            None => Ok(self.choose_action())
        }
    }

    /// Evaluate the root once and return the priors as the policy, without
    /// performing any rollouts.
    ///
    /// # Arguments
    ///
    /// * `root_state` -
    ///
    pub fn run_policy_only(&self, root_state: &E::State) -> Result<MctsResult<ActionOf<E>>, SearchError> {
        self.set_root_state(root_state)?;

        let root = self.shared.tree.root();

        self.ensure_root_evaluated(&root)?;
        Ok(self.ranked_result(PickMethod::StrongestPrior))
    }

    /// Keep the subtree under `action` for the next search.
    ///
    /// # Arguments
    ///
    /// * `action` -
    ///
    pub fn tree_advance(&self, action: ActionOf<E>) {
        self.shared.tree.advance(action);
    }

    pub fn clear(&self) {
        self.shared.tree.clear();
    }

    /// Stop the worker threads and join them. The engine cannot be used
    /// afterwards.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shared.done.set();

        for tx in &self.ready {
            // wake any worker parked on its ready signal
            tx.send(0).ok();
        }

        self.shared.done.wait(self.ready.len());

        let mut handles = self.handles.lock().expect("could not acquire handle lock");

        for handle in handles.drain(..) {
            handle.join().expect("could not join search worker");
        }
    }

    /// Run `f` with the engine's spare actor.
    pub fn with_main_actor<T, F: FnOnce(&mut E) -> T>(&self, f: F) -> T {
        let mut actor = self.main_actor.lock().expect("could not acquire actor lock");

        f(&mut *actor)
    }

    fn set_root_state(&self, root_state: &E::State) -> Result<(), SearchError> {
        let root = self.shared.tree.root();
        let clone = root_state.clone();

        root.set_state_if_unset(move || Some(clone));

        match root.state() {
            Some(state) if state.hash() == root_state.hash() => Ok(()),
            _ => Err(SearchError::InvalidState)
        }
    }

    fn ensure_root_evaluated(&self, root: &Arc<Node<E::State>>) -> Result<(), SearchError> {
        if root.is_visited() {
            return Ok(());
        }

        if root.request_evaluation() {
            let state = root.state().expect("root state was just installed");
            let response = self.with_main_actor(|actor| actor.evaluate(state));

            match response {
                Ok(response) => {
                    root.set_evaluation(response);
                    Ok(())
                },
                Err(e) => {
                    root.abort_evaluation();
                    Err(SearchError::Evaluator(e))
                }
            }
        } else {
            // some worker is already expanding it
            root.wait_evaluation();
            Ok(())
        }
    }

    fn ranked_result(&self, rank_method: PickMethod) -> MctsResult<ActionOf<E>> {
        let root = self.shared.tree.root();
        let mut rng = self.rng.lock().expect("could not acquire rng lock");
        let mut result = MctsResult::new(rank_method);

        result.root_value = root.value();
        result.add_actions(
            root.edge_stats().into_iter()
                .map(|(action, stats)| (action, EdgeSnapshot::from_stats(&stats)))
                .collect(),
            &mut *rng
        );
        result
    }

    fn choose_action(&self) -> MctsResult<ActionOf<E>> {
        let result = self.ranked_result(self.options.pick_method);

        if result.total_visits == 0 && self.options.pick_method == PickMethod::MostVisited {
            // nothing was visited, fall back to the raw priors
            self.ranked_result(PickMethod::StrongestPrior)
        } else {
            result
        }
    }
}

impl<E: Actor> Drop for TreeSearch<E> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<E: Actor>(
    thread_id: usize,
    shared: Arc<Shared<E::State>>,
    mut actor: E,
    ready: Receiver<usize>
) {
    while let Ok(num_rollout) = ready.recv() {
        run_single(thread_id, &shared, &mut actor, num_rollout);

        if shared.done.get() {
            break;
        }

        shared.tree_ready.increment();
    }

    shared.done.notify();
}

/// One worker's share of a search: `num_rollout` rollouts in batches of
/// `num_rollouts_per_batch`.
fn run_single<E: Actor>(
    thread_id: usize,
    shared: &Shared<E::State>,
    actor: &mut E,
    num_rollout: usize
) {
    let root = shared.tree.root();

    if root.state().is_none() {
        if !shared.done.get() && num_rollout > 0 {
            warn!("[{}] search started without a root state", thread_id);
        }
        return;
    }

    let step = zg_utils::max(shared.options.num_rollouts_per_batch, 1);
    let mut idx = 0;

    while idx < num_rollout && !should_stop(shared) {
        batch_rollouts(shared, actor, &root);
        idx += step;
    }
}

fn should_stop<S: GameState>(shared: &Shared<S>) -> bool {
    shared.done.get() || shared.abort_run.load(Ordering::Acquire)
}

/// Gather a handful of rollouts, evaluate their unique leaves as one batch,
/// then back the rewards up while reversing the matching virtual losses.
fn batch_rollouts<E: Actor>(shared: &Shared<E::State>, actor: &mut E, root: &Arc<Node<E::State>>) {
    let count = zg_utils::max(shared.options.num_rollouts_per_batch, 1);
    let mut trajs = Vec::with_capacity(count);

    for _ in 0..count {
        trajs.push(single_rollout(shared, &*actor, root));
    }

    // deduplicate the leaves and contend for their evaluation rights;
    // losing a leaf to another thread (or to a duplicate in this very
    // batch) is fine, we will wait for whoever won
    let mut locked = vec! [];
    let mut unique: Vec<(usize, usize)> = vec! [];

    for (index, traj) in trajs.iter().enumerate() {
        if traj.leaf.request_evaluation() {
            locked.push(traj.leaf.clone());
        }

        match unique.iter_mut().find(|(first, _)| trajs[*first].leaf.id() == traj.leaf.id()) {
            Some(entry) => { entry.1 += 1; },
            None => { unique.push((index, 1)); }
        }
    }

    if !locked.is_empty() {
        let states = locked.iter()
            .map(|leaf| leaf.state().expect("locked leaf without a state"))
            .collect::<Vec<_>>();

        match actor.evaluate_batch(&states) {
            Ok(responses) => {
                debug_assert_eq!(responses.len(), locked.len());

                for (leaf, response) in locked.iter().zip(responses.into_iter()) {
                    leaf.set_evaluation(response);
                }
            },
            Err(e) => {
                // give the claims back and abandon the whole batch, the
                // virtual losses stay behind until the nodes are freed
                for leaf in &locked {
                    leaf.abort_evaluation();
                }

                if e.is_fatal() {
                    *shared.failure.lock().expect("could not acquire failure lock") = Some(e);
                    shared.abort_run.store(true, Ordering::Release);
                }
                return;
            }
        }
    }

    for (first, count) in unique {
        let traj = &trajs[first];

        if !traj.leaf.wait_evaluation() {
            continue;
        }

        let state = traj.leaf.state().expect("evaluated leaf without a state");
        let reward = actor.reward(state, traj.leaf.value());
        let virtual_loss = shared.options.virtual_loss * count as f32;

        for (node, action) in &traj.path {
            node.update_edge_stats(*action, reward, virtual_loss);
        }
    }
}

/// Descend from the root while nodes are expanded, leaving a virtual loss
/// on every edge that was followed. Stops at the first unexpanded node, at
/// a node with no moves, or where the state could not be advanced.
fn single_rollout<E: Actor>(
    shared: &Shared<E::State>,
    actor: &E,
    root: &Arc<Node<E::State>>
) -> Traj<E::State> {
    let mut node = root.clone();
    let mut depth = 0;
    let mut path = vec! [];

    while node.is_visited() {
        let action = match node.find_move(&shared.options.alg, depth) {
            Some(action) => action,
            None => break
        };

        if shared.options.virtual_loss > 0.0 {
            node.add_virtual_loss(action, shared.options.virtual_loss);
        }
        path.push((node.clone(), action));

        let next_id = node.follow_edge(action, &shared.tree);
        let next = match shared.tree.get(next_id) {
            Some(next) => next,
            None => break
        };

        let parent = node.clone();
        let allocated = next.set_state_if_unset(|| {
            let mut state = parent.state()?.clone();

            if actor.forward(&mut state, action) {
                Some(state)
            } else {
                None
            }
        });

        if !allocated {
            break;
        }

        node = next;
        depth += 1;
    }

    Traj { path: path, leaf: node }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{GameAction, NodeResponse};
    use zg_go::{Board, Color, Vertex};

    /// Evaluates every legal action with a uniform prior and a value that
    /// only depends on the position hash, so searches are reproducible.
    #[derive(Clone)]
    struct HashActor;

    impl HashActor {
        fn response(state: &Board) -> NodeResponse<Vertex> {
            let q_flip = state.to_move() == Color::White;

            if state.terminated() {
                return NodeResponse::terminal(state.evaluate(), q_flip);
            }

            let actions = state.legal_actions();
            let prior = (actions.len() as f32).recip();
            let value = ((state.hash() % 1000) as f32) / 1000.0 - 0.5;

            NodeResponse {
                pi: actions.into_iter().map(|a| (a, prior)).collect(),
                value: value,
                q_flip: q_flip
            }
        }
    }

    impl Actor for HashActor {
        type State = Board;

        fn evaluate(&mut self, state: &Board) -> Result<NodeResponse<Vertex>, EvalError> {
            Ok(Self::response(state))
        }
    }

    /// Always fails, fatally or not.
    #[derive(Clone)]
    struct FailingActor {
        error: EvalError
    }

    impl Actor for FailingActor {
        type State = Board;

        fn evaluate(&mut self, _state: &Board) -> Result<NodeResponse<Vertex>, EvalError> {
            Err(self.error.clone())
        }
    }

    fn options(num_threads: usize, rollouts: usize) -> SearchOptions {
        SearchOptions {
            num_threads: num_threads,
            num_rollouts_per_thread: rollouts,
            num_rollouts_per_batch: 4,
            virtual_loss: 1.0,
            root_epsilon: 0.0,
            root_alpha: 0.03,
            persistent_tree: true,
            pick_method: PickMethod::MostVisited,
            seed: 42,
            alg: Default::default()
        }
    }

    #[test]
    fn search_visits_the_budget() {
        let search = TreeSearch::new(options(2, 16), |_| HashActor);
        let result = search.run(&Board::new(7.5)).unwrap();

        assert!(result.total_visits > 0);
        assert!(result.action_edge_pairs.len() > 0);
    }

    #[test]
    fn zero_rollouts_returns_the_priors() {
        let search = TreeSearch::new(options(1, 0), |_| HashActor);
        let result = search.run(&Board::new(7.5)).unwrap();

        assert_eq!(result.total_visits, 0);
        assert_eq!(result.rank_method, PickMethod::StrongestPrior);
        assert!(!result.mcts_policy.entries.is_empty());
    }

    #[test]
    fn single_thread_without_virtual_loss_is_deterministic() {
        let run = || {
            let mut opts = options(1, 32);

            opts.virtual_loss = 0.0;

            let search = TreeSearch::new(opts, |_| HashActor);
            let result = search.run(&Board::new(7.5)).unwrap();

            (result.best_action, result.total_visits)
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn terminal_root_yields_the_default_action() {
        let mut board = Board::new(7.5);

        assert!(board.place(Vertex::PASS));
        assert!(board.place(Vertex::PASS));
        assert!(board.terminated());

        let search = TreeSearch::new(options(1, 8), |_| HashActor);
        let result = search.run(&board).unwrap();

        assert_eq!(result.best_action, Vertex::default_value());
        assert_eq!(result.total_visits, 0);
        assert_eq!(result.root_value, board.evaluate());
    }

    #[test]
    fn mismatched_root_state_is_rejected() {
        let search = TreeSearch::new(options(1, 8), |_| HashActor);

        search.run(&Board::new(7.5)).unwrap();

        // pretend the game moved on without telling the engine
        let mut other = Board::new(7.5);

        assert!(other.place(Vertex::new(4, 4)));
        assert!(matches!(search.run(&other), Err(SearchError::InvalidState)));
    }

    #[test]
    fn fatal_evaluator_failure_is_surfaced() {
        let error = EvalError::VersionMismatch { got: 2, required: 1 };
        let search = TreeSearch::new(options(1, 8), |_| FailingActor { error: error.clone() });

        // the root evaluation itself fails, which is already fatal
        match search.run(&Board::new(7.5)) {
            Err(SearchError::Evaluator(e)) => assert_eq!(e, error),
            other => panic!("expected evaluator error, got {:?}", other)
        }
    }

    #[test]
    fn persistent_tree_survives_an_advance() {
        let search = TreeSearch::new(options(1, 16), |_| HashActor);
        let mut board = Board::new(7.5);
        let result = search.run(&board).unwrap();

        assert!(board.place(result.best_action));
        search.tree_advance(result.best_action);

        // the follow-up search runs from the reused subtree
        let result = search.run(&board).unwrap();

        assert!(result.total_visits > 0);
    }

    #[test]
    fn policy_only_ranks_by_prior() {
        let search = TreeSearch::new(options(1, 8), |_| HashActor);
        let result = search.run_policy_only(&Board::new(7.5)).unwrap();

        assert_eq!(result.rank_method, PickMethod::StrongestPrior);
        assert_eq!(result.total_visits, 0);
    }

    #[test]
    fn stop_is_idempotent_and_joins() {
        let search = TreeSearch::new(options(4, 8), |_| HashActor);

        search.run(&Board::new(7.5)).unwrap();
        search.stop();
        search.stop();
    }

    #[test]
    fn parallel_search_keeps_visit_counts_consistent() {
        let search = TreeSearch::new(options(4, 32), |_| HashActor);

        search.run(&Board::new(7.5)).unwrap();

        let root = search.tree().root();
        let total = root.edge_stats().iter().map(|(_, s)| s.num_visits).sum::<u32>();

        assert_eq!(total, root.num_visits());

        // no virtual loss may survive a completed search
        for (_, stats) in root.edge_stats() {
            assert_eq!(stats.virtual_loss, 0.0, "leftover virtual loss");
        }
    }

    #[test]
    fn random_pick_selects_an_edge() {
        let mut opts = options(1, 8);

        opts.pick_method = PickMethod::UniformRandom;

        let search = TreeSearch::new(opts, |_| HashActor);
        let result = search.run(&Board::new(7.5)).unwrap();
        let chosen = result.action_edge_pairs.iter().any(|&(a, _)| a == result.best_action);

        assert!(chosen);
    }

    #[test]
    fn exploration_noise_perturbs_the_root_priors() {
        let mut opts = options(1, 0);

        opts.root_epsilon = 0.25;

        let search = TreeSearch::new(opts, |_| HashActor);

        search.run(&Board::new(7.5)).unwrap();

        // the actor hands out uniform priors, so any spread is noise
        let priors = search.tree().root().edge_stats().into_iter()
            .map(|(_, stats)| stats.prior)
            .collect::<Vec<_>>();
        let spread = priors.iter().cloned().fold(0.0f32, f32::max)
            - priors.iter().cloned().fold(1.0f32, f32::min);

        assert!(spread > 1e-6, "priors were not perturbed");
    }
}
