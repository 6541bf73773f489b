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

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use rand::Rng;

use crate::base::{GameState, NodeId, NodeResponse, INVALID_NODE_ID};
use crate::dirichlet;
use crate::options::SearchAlgoOptions;
use zg_utils::sync::AtomicF32;

/// The live statistics of one edge, taken under the edge lock.
#[derive(Clone, Debug)]
pub struct EdgeStats {
    pub prior: f32,
    pub child: NodeId,
    pub reward: f32,
    pub num_visits: u32,
    pub virtual_loss: f32
}

impl EdgeStats {
    fn new(prior: f32) -> Self {
        Self {
            prior: prior,
            child: INVALID_NODE_ID,
            reward: 0.0,
            num_visits: 0,
            virtual_loss: 0.0
        }
    }

    /// Mean action value, zero while unvisited.
    pub fn q(&self) -> f32 {
        if self.num_visits > 0 {
            self.reward / self.num_visits as f32
        } else {
            0.0
        }
    }

    /// Returns the selection score terms for this edge.
    ///
    /// # Arguments
    ///
    /// * `flip_q_sign` - true when the node's player is minimizing
    /// * `total_parent_visits` -
    /// * `unsigned_default_q` - the Q given to unvisited edges
    ///
    fn score(&self, flip_q_sign: bool, total_parent_visits: u32, unsigned_default_q: f32) -> Score {
        let mut r = if flip_q_sign { -self.reward } else { self.reward };

        // the virtual loss counts as that many lost playouts until the
        // real reward arrives
        r -= self.virtual_loss;
        let num_visits_with_loss = self.num_visits as f32 + self.virtual_loss;

        Score {
            q: if num_visits_with_loss > 0.0 {
                r / num_visits_with_loss
            } else if flip_q_sign {
                -unsigned_default_q
            } else {
                unsigned_default_q
            },
            unsigned_q: if self.num_visits > 0 {
                self.reward / self.num_visits as f32
            } else {
                unsigned_default_q
            },
            prior_probability: self.prior / (1.0 + self.num_visits as f32)
                * (total_parent_visits as f32).sqrt(),
            first_visit: num_visits_with_loss == 0.0
        }
    }
}

struct Score {
    q: f32,
    unsigned_q: f32,
    prior_probability: f32,
    first_visit: bool
}

struct Edge<A> {
    action: A,
    stats: Mutex<EdgeStats>
}

/// Value, orientation and edges of a node, published by `set_evaluation`.
struct NodeBody<A> {
    value: f32,
    q_flip: bool,
    edges: Vec<Edge<A>>
}

/// A node of the search tree.
///
/// The body (value + edge list) is written exactly once, by the thread that
/// won `request_evaluation`, and the `visited` flag is its publication
/// barrier: the body is only read after `visited` loads true with acquire
/// ordering, and the edge list never changes afterwards. Per-edge statistics
/// are guarded by their own mutex.
pub struct Node<S: GameState> {
    id: NodeId,
    state: OnceLock<Option<Box<S>>>,
    eval_lock: AtomicBool,
    visited: AtomicBool,
    num_visits: AtomicU32,
    body: UnsafeCell<NodeBody<S::Action>>,
    unsigned_parent_q: f32,
    unsigned_mean_q: AtomicF32
}

unsafe impl<S: GameState> Sync for Node<S> { }

impl<S: GameState> Node<S> {
    fn new(id: NodeId, unsigned_parent_q: f32) -> Self {
        Self {
            id: id,
            state: OnceLock::new(),
            eval_lock: AtomicBool::new(false),
            visited: AtomicBool::new(false),
            num_visits: AtomicU32::new(0),
            body: UnsafeCell::new(NodeBody {
                value: 0.0,
                q_flip: false,
                edges: vec! []
            }),
            unsigned_parent_q: unsigned_parent_q,
            unsigned_mean_q: AtomicF32::new(unsigned_parent_q)
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn is_visited(&self) -> bool {
        self.visited.load(Ordering::Acquire)
    }

    pub fn num_visits(&self) -> u32 {
        self.num_visits.load(Ordering::Relaxed)
    }

    pub fn unsigned_parent_q(&self) -> f32 {
        self.unsigned_parent_q
    }

    pub fn unsigned_mean_q(&self) -> f32 {
        self.unsigned_mean_q.get()
    }

    /// Returns the value installed by the evaluation, zero before it.
    pub fn value(&self) -> f32 {
        if self.is_visited() {
            unsafe { (*self.body.get()).value }
        } else {
            0.0
        }
    }

    pub fn q_flip(&self) -> bool {
        if self.is_visited() {
            unsafe { (*self.body.get()).q_flip }
        } else {
            false
        }
    }

    /// Returns the memoized state, if it has been materialized.
    pub fn state(&self) -> Option<&S> {
        match self.state.get() {
            Some(Some(state)) => Some(&**state),
            _ => None
        }
    }

    /// Returns true if state allocation was attempted and failed, which is
    /// permanent for this node.
    pub fn is_state_invalid(&self) -> bool {
        matches!(self.state.get(), Some(None))
    }

    /// Materialize this node's state exactly once. Concurrent callers all
    /// observe the single factory run. A factory returning `None` marks the
    /// node invalid forever.
    ///
    /// # Arguments
    ///
    /// * `factory` -
    ///
    pub fn set_state_if_unset<F: FnOnce() -> Option<S>>(&self, factory: F) -> bool {
        self.state.get_or_init(|| factory().map(Box::new)).is_some()
    }

    /// Try to claim the right to expand this node. At most one thread holds
    /// the claim at a time, and never after the node is visited.
    pub fn request_evaluation(&self) -> bool {
        if self.is_visited() {
            return false;
        }

        self.eval_lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Give the claim back without publishing anything, after a failed
    /// evaluation. Another thread may claim and retry later.
    pub fn abort_evaluation(&self) {
        self.eval_lock.store(false, Ordering::Release);
    }

    /// Wait until this node's evaluation is published. Returns false if the
    /// claim holder gave up instead.
    pub fn wait_evaluation(&self) -> bool {
        loop {
            if self.is_visited() {
                return true;
            }
            if !self.eval_lock.load(Ordering::Acquire) {
                // nobody is working on it anymore
                return self.is_visited();
            }

            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Publish the evaluation of this node and release the expansion claim.
    /// Must only be called by the thread that won `request_evaluation`.
    ///
    /// # Arguments
    ///
    /// * `response` -
    ///
    pub fn set_evaluation(&self, response: NodeResponse<S::Action>) {
        debug_assert!(!self.is_visited());
        debug_assert!(self.eval_lock.load(Ordering::Relaxed));

        unsafe {
            let body = &mut *self.body.get();

            body.value = response.value;
            body.q_flip = response.q_flip;
            body.edges = response.pi.into_iter()
                .map(|(action, prior)| Edge {
                    action: action,
                    stats: Mutex::new(EdgeStats::new(prior))
                })
                .collect();
        }

        self.visited.store(true, Ordering::Release);
        self.eval_lock.store(false, Ordering::Release);
    }

    fn edges(&self) -> &[Edge<S::Action>] {
        if self.is_visited() {
            unsafe { &(*self.body.get()).edges }
        } else {
            &[]
        }
    }

    fn find_edge(&self, action: S::Action) -> Option<&Edge<S::Action>> {
        self.edges().iter().find(|edge| edge.action == action)
    }

    /// Returns the actions of this node in first-seen order.
    pub fn actions(&self) -> Vec<S::Action> {
        self.edges().iter().map(|edge| edge.action).collect()
    }

    /// Returns a snapshot of every `(action, stats)` pair.
    pub fn edge_stats(&self) -> Vec<(S::Action, EdgeStats)> {
        self.edges().iter()
            .map(|edge| {
                (edge.action, edge.stats.lock().expect("could not acquire edge lock").clone())
            })
            .collect()
    }

    /// Mix dirichlet noise into the edge priors. Called once per search,
    /// at the root, after it has been expanded.
    ///
    /// # Arguments
    ///
    /// * `epsilon` -
    /// * `alpha` -
    /// * `rng` -
    ///
    pub fn enhance_exploration<R: Rng>(&self, epsilon: f32, alpha: f32, rng: &mut R) {
        let edges = self.edges();

        if epsilon <= 0.0 || edges.is_empty() {
            return;
        }

        let etas = dirichlet::sample(alpha, edges.len(), rng);

        for (edge, eta) in edges.iter().zip(etas.into_iter()) {
            let mut stats = edge.stats.lock().expect("could not acquire edge lock");

            stats.prior = (1.0 - epsilon) * stats.prior + epsilon * eta;
        }
    }

    /// Add a virtual loss to the given edge. Returns false if there is no
    /// such edge.
    ///
    /// # Arguments
    ///
    /// * `action` -
    /// * `virtual_loss` -
    ///
    pub fn add_virtual_loss(&self, action: S::Action, virtual_loss: f32) -> bool {
        match self.find_edge(action) {
            Some(edge) => {
                let mut stats = edge.stats.lock().expect("could not acquire edge lock");

                stats.virtual_loss += virtual_loss;
                true
            },
            None => false
        }
    }

    /// Back a reward up into the given edge, reversing the virtual loss
    /// that the matching descent added.
    ///
    /// # Arguments
    ///
    /// * `action` -
    /// * `reward` -
    /// * `virtual_loss` -
    ///
    pub fn update_edge_stats(&self, action: S::Action, reward: f32, virtual_loss: f32) -> bool {
        match self.find_edge(action) {
            Some(edge) => {
                self.num_visits.fetch_add(1, Ordering::AcqRel);

                let mut stats = edge.stats.lock().expect("could not acquire edge lock");

                stats.reward += reward;
                stats.num_visits += 1;
                stats.virtual_loss -= virtual_loss;
                true
            },
            None => false
        }
    }

    /// Follow the given edge, lazily allocating the child node.
    ///
    /// # Arguments
    ///
    /// * `action` -
    /// * `tree` -
    ///
    pub fn follow_edge(&self, action: S::Action, tree: &SearchTree<S>) -> NodeId {
        match self.find_edge(action) {
            Some(edge) => {
                let mut stats = edge.stats.lock().expect("could not acquire edge lock");

                if stats.child == INVALID_NODE_ID {
                    stats.child = tree.add_node(self.unsigned_mean_q.get());
                }
                stats.child
            },
            None => INVALID_NODE_ID
        }
    }

    /// Returns the action maximizing the PUCT score, or `None` when there
    /// are no edges. Ties keep the first-seen action.
    ///
    /// # Arguments
    ///
    /// * `alg_opt` -
    /// * `depth` - distance from the root of the current search
    ///
    pub fn find_move(&self, alg_opt: &SearchAlgoOptions, depth: usize) -> Option<S::Action> {
        let edges = self.edges();

        if edges.is_empty() {
            return None;
        }

        let unsigned_default_q =
            if alg_opt.unexplored_q_zero || (alg_opt.root_unexplored_q_zero && depth == 0) {
                self.unsigned_mean_q.set(0.0);
                0.0
            } else {
                self.unsigned_mean_q.get()
            };
        let flip = self.q_flip();
        let all_visits = self.num_visits.load(Ordering::Acquire) + 1;

        let mut best_action = None;
        let mut max_score = f32::MIN;
        let mut total_unsigned_q = 0.0;
        let mut total_visits = 0;

        for edge in edges.iter() {
            let stats = edge.stats.lock().expect("could not acquire edge lock");
            let terms = stats.score(flip, all_visits, unsigned_default_q);
            let score = if alg_opt.c_puct > 0.0 {
                terms.prior_probability * alg_opt.c_puct + terms.q
            } else {
                terms.q
            };

            if score > max_score {
                max_score = score;
                best_action = Some(edge.action);
            }
            if !terms.first_visit {
                total_unsigned_q += terms.unsigned_q;
                total_visits += 1;
            }
        }

        self.unsigned_mean_q.set(
            (self.unsigned_parent_q + total_unsigned_q) / (total_visits + 1) as f32
        );

        best_action
    }
}

/// The node arena. Nodes are owned by the tree and handed out as `Arc`s, so
/// the allocator lock is only ever held for the map operation itself.
pub struct SearchTree<S: GameState> {
    nodes: Mutex<HashMap<NodeId, Arc<Node<S>>>>,
    next_id: Mutex<NodeId>,
    root_id: Mutex<NodeId>
}

impl<S: GameState> Default for SearchTree<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: GameState> SearchTree<S> {
    pub fn new() -> Self {
        let out = Self {
            nodes: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
            root_id: Mutex::new(INVALID_NODE_ID)
        };

        out.allocate_root();
        out
    }

    /// Destroy every node and install a fresh, empty root.
    pub fn clear(&self) {
        self.nodes.lock().expect("could not acquire tree lock").clear();
        *self.root_id.lock().expect("could not acquire root lock") = INVALID_NODE_ID;
        self.allocate_root();
    }

    /// Destroy every node and install `state` at the new root.
    ///
    /// # Arguments
    ///
    /// * `state` -
    ///
    pub fn reset(&self, state: S) {
        self.clear();
        self.root().set_state_if_unset(move || Some(state));
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().expect("could not acquire tree lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn root_id(&self) -> NodeId {
        *self.root_id.lock().expect("could not acquire root lock")
    }

    pub fn root(&self) -> Arc<Node<S>> {
        self.get(self.root_id()).expect("tree has no root")
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<Node<S>>> {
        if id == INVALID_NODE_ID {
            return None;
        }

        self.nodes.lock().expect("could not acquire tree lock").get(&id).cloned()
    }

    /// Allocate a fresh node with a monotonically increasing id.
    ///
    /// # Arguments
    ///
    /// * `unsigned_parent_q` -
    ///
    pub fn add_node(&self, unsigned_parent_q: f32) -> NodeId {
        let mut next_id = self.next_id.lock().expect("could not acquire id lock");
        let id = *next_id;
        *next_id += 1;

        self.nodes.lock().expect("could not acquire tree lock")
            .insert(id, Arc::new(Node::new(id, unsigned_parent_q)));
        id
    }

    pub fn free_node(&self, id: NodeId) {
        self.nodes.lock().expect("could not acquire tree lock").remove(&id);
    }

    /// Destroy the subtree rooted at `id`. Invalid handles are skipped.
    ///
    /// # Arguments
    ///
    /// * `id` -
    ///
    pub fn recursive_free(&self, id: NodeId) {
        let mut pending = vec! [id];

        while let Some(id) = pending.pop() {
            let node = match self.get(id) {
                Some(node) => node,
                None => continue
            };

            for (_, stats) in node.edge_stats() {
                if stats.virtual_loss != 0.0 {
                    debug!("sweeping node {} with leftover virtual loss {}", id, stats.virtual_loss);
                }
                pending.push(stats.child);
            }

            self.free_node(id);
        }
    }

    /// Make the child reached by `action` the new root, freeing the rest of
    /// the tree. A fresh root is allocated if that child was never visited.
    ///
    /// # Arguments
    ///
    /// * `action` -
    ///
    pub fn advance(&self, action: S::Action) {
        let root = self.root();
        let mut next_root = INVALID_NODE_ID;

        for (other, stats) in root.edge_stats() {
            if other == action {
                next_root = stats.child;
            } else {
                self.recursive_free(stats.child);
            }
        }

        self.free_node(root.id());
        *self.root_id.lock().expect("could not acquire root lock") = next_root;
        self.allocate_root();
    }

    /// Advance the root along `moves`, reusing the existing subtree. Falls
    /// back to `reset(state)` when any move along the way has no
    /// materialized edge. Returns true if the subtree was reused.
    ///
    /// # Arguments
    ///
    /// * `moves` -
    /// * `state` -
    ///
    pub fn tree_advance(&self, moves: &[S::Action], state: S) -> bool {
        // check the whole path first so a partial match does not free
        // anything it should not
        let mut id = self.root_id();

        for &action in moves {
            let node = match self.get(id) {
                Some(node) => node,
                None => {
                    self.reset(state);
                    return false;
                }
            };
            let child = node.edge_stats().into_iter()
                .find(|(other, _)| *other == action)
                .map(|(_, stats)| stats.child)
                .unwrap_or(INVALID_NODE_ID);

            if child == INVALID_NODE_ID {
                self.reset(state);
                return false;
            }
            id = child;
        }

        for &action in moves {
            self.advance(action);
        }
        self.root().set_state_if_unset(move || Some(state));
        true
    }

    fn allocate_root(&self) {
        let mut root_id = self.root_id.lock().expect("could not acquire root lock");

        if *root_id == INVALID_NODE_ID {
            drop(root_id);
            let id = self.add_node(0.0);
            *self.root_id.lock().expect("could not acquire root lock") = id;
        }
    }
}
