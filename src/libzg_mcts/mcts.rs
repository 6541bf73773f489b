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

use crate::base::{Actor, GameState, SearchError};
use crate::options::{CtrlOptions, SearchOptions};
use crate::result::{MctsPolicy, MctsResult};
use crate::search::TreeSearch;

type ActionOf<E> = <<E as Actor>::State as GameState>::Action;

/// An agent wrapping a `TreeSearch` engine: it keeps the tree aligned with
/// the game as moves are played, remembers the last result, and applies
/// per-move control overrides.
pub struct MctsAi<E: Actor> {
    engine: TreeSearch<E>,
    ctrl: CtrlOptions,
    last_result: Option<MctsResult<ActionOf<E>>>
}

impl<E: Actor> MctsAi<E> {
    /// # Arguments
    ///
    /// * `options` -
    /// * `actor_gen` - called once per worker thread
    ///
    pub fn new<F: FnMut(usize) -> E>(options: SearchOptions, actor_gen: F) -> Self {
        Self {
            engine: TreeSearch::new(options, actor_gen),
            ctrl: CtrlOptions::default(),
            last_result: None
        }
    }

    pub fn options(&self) -> &SearchOptions {
        self.engine.options()
    }

    /// Overlay per-move overrides onto the next `act` call.
    ///
    /// # Arguments
    ///
    /// * `ctrl` -
    ///
    pub fn set_ctrl(&mut self, ctrl: &CtrlOptions) {
        self.ctrl.append(ctrl);
    }

    /// Search the given position and return the chosen action.
    ///
    /// # Arguments
    ///
    /// * `state` -
    ///
    pub fn act(&mut self, state: &E::State) -> Result<ActionOf<E>, SearchError> {
        self.align_state(state);

        let rollouts = if self.ctrl.rollouts_per_thread > 0 {
            self.ctrl.rollouts_per_thread as usize
        } else {
            self.options().num_rollouts_per_thread
        };
        let result = self.engine.run_with(state, rollouts)?;

        self.ctrl.reset();

        let action = result.best_action;

        self.last_result = Some(result);
        Ok(action)
    }

    /// Choose an action from the raw priors, without searching.
    ///
    /// # Arguments
    ///
    /// * `state` -
    ///
    pub fn act_policy_only(&mut self, state: &E::State) -> Result<ActionOf<E>, SearchError> {
        self.align_state(state);

        let result = self.engine.run_policy_only(state)?;
        let action = result.best_action;

        self.last_result = Some(result);
        Ok(action)
    }

    pub fn last_result(&self) -> Option<&MctsResult<ActionOf<E>>> {
        self.last_result.as_ref()
    }

    /// The engine's opinion of the last searched position: the chosen
    /// edge's Q once anything was visited, the raw root value otherwise.
    pub fn value(&self) -> f32 {
        match &self.last_result {
            Some(result) if result.total_visits > 0 => result.best_edge.q(),
            Some(result) => result.root_value,
            None => 0.0
        }
    }

    /// The normalized search policy of the last `act` call.
    pub fn mcts_policy(&self) -> MctsPolicy<ActionOf<E>> {
        let mut policy = self.last_result.as_ref()
            .map(|result| result.mcts_policy.clone())
            .unwrap_or_default();

        policy.normalize(1.0);
        policy
    }

    /// Tell the tree the game advanced by `action`.
    ///
    /// # Arguments
    ///
    /// * `action` -
    ///
    pub fn forward(&mut self, action: ActionOf<E>) {
        if self.options().persistent_tree {
            self.engine.tree_advance(action);
        }
    }

    /// The game ended, drop the tree.
    pub fn end_game(&mut self) {
        self.engine.clear();
        self.last_result = None;
    }

    /// Bring the tree's root in line with `state`: reuse the subtree when
    /// the game only advanced by known moves, start over otherwise.
    fn align_state(&self, state: &E::State) {
        if !self.options().persistent_tree {
            self.engine.tree().reset(state.clone());
            return;
        }

        let root = self.engine.tree().root();

        match root.state() {
            None => {
                self.engine.tree().reset(state.clone());
            },
            Some(root_state) if root_state.hash() == state.hash() => {},
            Some(root_state) => {
                match state.moves_since(root_state) {
                    Some(moves) => {
                        self.engine.tree().tree_advance(&moves, state.clone());
                    },
                    None => {
                        self.engine.tree().reset(state.clone());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{EvalError, NodeResponse};
    use crate::options::PickMethod;
    use zg_go::{Board, Color, Vertex};

    #[derive(Clone)]
    struct UniformActor;

    impl Actor for UniformActor {
        type State = Board;

        fn evaluate(&mut self, state: &Board) -> Result<NodeResponse<Vertex>, EvalError> {
            let q_flip = Board::to_move(state) == Color::White;

            if state.terminated() {
                return Ok(NodeResponse::terminal(Board::evaluate(state), q_flip));
            }

            let actions = state.legal_moves(Board::to_move(state));
            let prior = (actions.len() as f32).recip();

            Ok(NodeResponse {
                pi: actions.into_iter().map(|a| (a, prior)).collect(),
                value: 0.0,
                q_flip: q_flip
            })
        }
    }

    fn options() -> SearchOptions {
        SearchOptions {
            num_threads: 1,
            num_rollouts_per_thread: 16,
            num_rollouts_per_batch: 4,
            virtual_loss: 1.0,
            root_epsilon: 0.0,
            root_alpha: 0.03,
            persistent_tree: true,
            pick_method: PickMethod::MostVisited,
            seed: 7,
            alg: Default::default()
        }
    }

    #[test]
    fn plays_a_few_moves() {
        let mut ai = MctsAi::new(options(), |_| UniformActor);
        let mut board = Board::new(7.5);

        for _ in 0..4 {
            let action = ai.act(&board).unwrap();

            assert!(board.place(action), "engine chose an illegal move");
            ai.forward(action);
        }

        assert!(ai.last_result().is_some());
        assert_eq!(board.ply(), 4);
    }

    #[test]
    fn act_after_an_unseen_move_resets_the_tree() {
        let mut ai = MctsAi::new(options(), |_| UniformActor);
        let mut board = Board::new(7.5);

        ai.act(&board).unwrap();

        // advance the game behind the engine's back
        assert!(board.place(Vertex::new(0, 0)));
        assert!(board.place(Vertex::new(5, 5)));

        let action = ai.act(&board).unwrap();

        assert!(board.is_valid(Board::to_move(&board), action));
    }

    #[test]
    fn policy_only_act_is_legal() {
        let mut ai = MctsAi::new(options(), |_| UniformActor);
        let board = Board::new(7.5);
        let action = ai.act_policy_only(&board).unwrap();

        assert!(board.is_valid(Color::Black, action));
        assert_eq!(ai.value(), 0.0);
    }

    #[test]
    fn ctrl_override_is_one_shot() {
        let mut ai = MctsAi::new(options(), |_| UniformActor);
        let board = Board::new(7.5);

        ai.set_ctrl(&CtrlOptions { rollouts_per_thread: 2 });
        ai.act(&board).unwrap();

        // the override was consumed by the first call
        assert_eq!(ai.ctrl.rollouts_per_thread, -1);
    }

    #[test]
    fn mcts_policy_is_a_distribution() {
        let mut ai = MctsAi::new(options(), |_| UniformActor);

        ai.act(&Board::new(7.5)).unwrap();

        let policy = ai.mcts_policy();
        let total = policy.entries.iter().map(|&(_, w)| w).sum::<f32>();

        assert!((total - 1.0).abs() < 1e-3);
    }
}
