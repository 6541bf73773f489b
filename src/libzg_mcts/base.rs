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

use std::fmt;
use std::hash::Hash;

/// Handle into a search tree's node arena.
pub type NodeId = i64;

/// The sentinel used by edges whose child has not been allocated yet.
pub const INVALID_NODE_ID: NodeId = -1;

/// A move in some game, identified by a stable value that also knows where
/// its logit lives in the evaluator's policy head. Several actions may map
/// to the same policy index, the caller disambiguates by legality.
pub trait GameAction: Copy + Eq + Hash + Send + Sync + fmt::Debug + 'static {
    /// The action returned when a search produced nothing at all.
    fn default_value() -> Self;

    /// The flattened coordinate of this action in the policy head.
    fn policy_index(&self) -> usize;
}

/// A game position as seen by the search. The engine never inspects the
/// position itself, it only copies it, advances it, and ships its feature
/// tensor to the evaluator.
pub trait GameState: Clone + Send + Sync + 'static {
    type Action: GameAction;

    /// Returns the player to move, `0` or `1`, where player `0` is the one
    /// whose point of view rewards are expressed in.
    fn to_move(&self) -> usize;

    /// Returns true if the game has ended.
    fn terminated(&self) -> bool;

    /// Apply `action` for the player to move. Returns false, leaving the
    /// state untouched, if the action is illegal.
    fn forward(&mut self, action: Self::Action) -> bool;

    /// Returns every legal action, in a stable order.
    fn legal_actions(&self) -> Vec<Self::Action>;

    /// Returns the `(channels, height, width)` shape of the feature tensor.
    fn feature_shape() -> (usize, usize, usize);

    /// Write this state's feature tensor into `out`.
    fn features(&self, out: &mut [f32]);

    /// Returns a hash of this position. The search assumes it is collision
    /// free when deciding whether two states are the same.
    fn hash(&self) -> u64;

    /// Returns the terminal outcome in `[-1, 1]` from player 0's point
    /// of view.
    fn evaluate(&self) -> f32;

    /// If `self` continues the game recorded in `other`, returns the moves
    /// played since.
    fn moves_since(&self, other: &Self) -> Option<Vec<Self::Action>>;
}

/// What the evaluator said about one state: prior probabilities for its
/// legal actions (in descending order of probability), the position value,
/// and whether this node's player is minimizing in the global convention.
#[derive(Clone, Debug)]
pub struct NodeResponse<A> {
    pub pi: Vec<(A, f32)>,
    pub value: f32,
    pub q_flip: bool
}

impl<A> NodeResponse<A> {
    /// The response for a terminal state: no actions, just the outcome.
    pub fn terminal(value: f32, q_flip: bool) -> Self {
        Self { pi: vec! [], value, q_flip }
    }
}

/// Why an evaluation did not produce a usable response.
#[derive(Clone, Debug, PartialEq)]
pub enum EvalError {
    /// No reply arrived within the deadline. The rollout is abandoned.
    Timeout,

    /// The evaluator replied with a failure status. The rollout is
    /// abandoned and may be retried.
    Failed,

    /// The reply was produced by the wrong model. Fatal for the engine.
    VersionMismatch { got: i64, required: i64 }
}

impl EvalError {
    /// Returns true if the whole engine should give up rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EvalError::VersionMismatch { .. })
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EvalError::Timeout => write!(fmt, "evaluation timed out"),
            EvalError::Failed => write!(fmt, "evaluator replied with failure"),
            EvalError::VersionMismatch { got, required } => {
                write!(fmt, "reply from model {} but model {} is required", got, required)
            }
        }
    }
}

/// Why a search could not be run at all.
#[derive(Clone, Debug, PartialEq)]
pub enum SearchError {
    /// The root state was missing, or its hash disagreed with the state
    /// the caller supplied.
    InvalidState,

    /// Every path into the evaluator failed fatally.
    Evaluator(EvalError)
}

impl fmt::Display for SearchError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SearchError::InvalidState => write!(fmt, "root state missing or inconsistent"),
            SearchError::Evaluator(e) => write!(fmt, "{}", e)
        }
    }
}

/// The capability set the search needs from whoever owns the evaluator
/// connection. One actor is created per worker thread, so methods take
/// `&mut self` and never need internal locking.
pub trait Actor: Send + 'static {
    type State: GameState;

    /// Evaluate a single state.
    fn evaluate(
        &mut self,
        state: &Self::State
    ) -> Result<NodeResponse<<Self::State as GameState>::Action>, EvalError>;

    /// Evaluate a batch of states in one round-trip. The default forwards
    /// to `evaluate` one state at a time.
    fn evaluate_batch(
        &mut self,
        states: &[&Self::State]
    ) -> Result<Vec<NodeResponse<<Self::State as GameState>::Action>>, EvalError> {
        states.iter().map(|s| self.evaluate(s)).collect()
    }

    /// Apply `action` to `state`. Returns false if it was illegal.
    fn forward(&self, state: &mut Self::State, action: <Self::State as GameState>::Action) -> bool {
        state.forward(action)
    }

    /// The reward backed up for a leaf with the given value.
    fn reward(&self, _state: &Self::State, value: f32) -> f32 {
        value
    }
}
