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
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use zg_batch::{Batcher, Extractor, FieldType, ReplyStatus};
use zg_go::{features, Board, Vertex};
use zg_mcts::base::{Actor, EvalError, NodeResponse};
use zg_mcts::board_state::q_flip_for;

/// What one game position ships to the evaluator.
pub struct EvalAsk {
    features: Vec<f32>
}

impl EvalAsk {
    fn new(board: &Board) -> Self {
        let mut features = vec! [0.0; features::FEATURE_SIZE];

        features::extract(board, &mut features);
        Self { features: features }
    }
}

/// What comes back: the raw policy head, the value, and the version of the
/// model that produced them.
#[derive(Clone)]
pub struct EvalReply {
    pub pi: Vec<f32>,
    pub value: f32,
    pub version: i64
}

impl Default for EvalReply {
    fn default() -> Self {
        Self {
            pi: vec! [0.0; features::POLICY_SIZE],
            value: 0.0,
            version: -1
        }
    }
}

/// The rendezvous channel type every game thread of a worker shares.
pub type EvalBatcher = Batcher<EvalAsk, EvalReply>;

/// Register the evaluator's slab schema: the feature planes in, `pi`, `V`
/// and the stamped model version `rv` out. Called once at startup.
pub fn make_extractor() -> Extractor<EvalAsk, EvalReply> {
    Extractor::new()
        .input("s", FieldType::Float32, features::FEATURE_SIZE, |ask: &EvalAsk, mut dst| {
            dst.as_f32().copy_from_slice(&ask.features);
        })
        .output("pi", FieldType::Float32, features::POLICY_SIZE, |reply: &mut EvalReply, src| {
            reply.pi.copy_from_slice(src.as_f32());
        })
        .output("V", FieldType::Float32, 1, |reply: &mut EvalReply, src| {
            reply.value = src.as_f32()[0];
        })
        .output("rv", FieldType::Int64, 1, |reply: &mut EvalReply, src| {
            reply.version = src.as_i64()[0];
        })
}

/// Fixed parameters of one actor.
#[derive(Clone, Debug)]
pub struct ActorParams {
    pub name: String,
    pub komi: f32,
    pub ply_pass_enabled: usize
}

impl Default for ActorParams {
    fn default() -> Self {
        Self {
            name: "actor".to_string(),
            komi: *zg_utils::config::KOMI,
            ply_pass_enabled: *zg_utils::config::PLY_PASS_ENABLED
        }
    }
}

/// The search's window onto the evaluator: terminal states are answered
/// locally, everything else goes through the batcher. Replies stamped by a
/// model other than the required one are fatal; with no required version
/// (async mode) every contributing version is remembered instead.
pub struct BatchActor {
    params: ActorParams,
    batcher: EvalBatcher,
    required_version: Arc<AtomicI64>,
    used_models: Arc<Mutex<BTreeSet<i64>>>
}

impl BatchActor {
    /// # Arguments
    ///
    /// * `params` -
    /// * `batcher` -
    /// * `required_version` - shared with whoever may restart the engine
    /// * `used_models` - shared sink of contributing model versions
    ///
    pub fn new(
        params: ActorParams,
        batcher: EvalBatcher,
        required_version: Arc<AtomicI64>,
        used_models: Arc<Mutex<BTreeSet<i64>>>
    ) -> Self {
        Self {
            params: params,
            batcher: batcher,
            required_version: required_version,
            used_models: used_models
        }
    }

    fn post_process(&self, board: &Board, reply: &EvalReply) -> Result<NodeResponse<Vertex>, EvalError> {
        let required = self.required_version.load(Ordering::Acquire);

        if required >= 0 && reply.version != required {
            return Err(EvalError::VersionMismatch {
                got: reply.version,
                required: required
            });
        }

        self.used_models.lock().expect("could not acquire used models lock")
            .insert(reply.version);

        let pass_enabled = board.ply() >= self.params.ply_pass_enabled;
        let to_move = Board::to_move(board);
        let mut pi = board.legal_moves(to_move).into_iter()
            .filter(|action| pass_enabled || !action.is_pass())
            .map(|action| (action, reply.pi[action.index()]))
            .collect::<Vec<_>>();

        if pi.is_empty() {
            // there is always a way out
            pi.push((Vertex::PASS, 1.0));
        }

        // strongest first, so tie-breaks in the tree are stable
        pi.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let total = pi.iter().map(|&(_, p)| p).sum::<f32>() + 1e-10;

        for entry in pi.iter_mut() {
            entry.1 /= total;
        }

        Ok(NodeResponse {
            pi: pi,
            value: reply.value,
            q_flip: q_flip_for(board)
        })
    }

    fn pre_evaluate(&self, board: &Board) -> Option<NodeResponse<Vertex>> {
        if board.terminated() {
            Some(NodeResponse::terminal(board.evaluate(), q_flip_for(board)))
        } else {
            None
        }
    }
}

impl Actor for BatchActor {
    type State = Board;

    fn evaluate(&mut self, state: &Board) -> Result<NodeResponse<Vertex>, EvalError> {
        if let Some(response) = self.pre_evaluate(state) {
            return Ok(response);
        }

        let ask = EvalAsk::new(state);
        let mut reply = EvalReply::default();

        match self.batcher.send_wait(&ask, &mut reply) {
            ReplyStatus::Success => self.post_process(state, &reply),
            _ => Err(EvalError::Failed)
        }
    }

    fn evaluate_batch(
        &mut self,
        states: &[&Board]
    ) -> Result<Vec<NodeResponse<Vertex>>, EvalError> {
        // answer terminal states locally, batch the rest
        let mut responses = states.iter()
            .map(|state| self.pre_evaluate(state))
            .collect::<Vec<_>>();
        let pending = (0..states.len())
            .filter(|&i| responses[i].is_none())
            .collect::<Vec<_>>();

        if !pending.is_empty() {
            let asks = pending.iter()
                .map(|&i| EvalAsk::new(states[i]))
                .collect::<Vec<_>>();
            let ask_refs = asks.iter().collect::<Vec<_>>();
            let mut replies = vec! [EvalReply::default(); pending.len()];

            // more leaves than one physical batch can hold are split into
            // sub-batches, each released as its reply lands
            let sub_batch = self.batcher.options().max_batch;
            let status = self.batcher.send_batches_wait(
                &ask_refs,
                &mut replies,
                sub_batch,
                |range, status| {
                    debug!("sub-batch {:?} finished with {:?}", range, status);
                }
            );

            match status {
                ReplyStatus::Success => {
                    for (slot, &i) in pending.iter().enumerate() {
                        responses[i] = Some(self.post_process(states[i], &replies[slot])?);
                    }
                },
                _ => {
                    return Err(EvalError::Failed);
                }
            }
        }

        Ok(responses.into_iter().map(|r| r.expect("response was filled in")).collect())
    }
}
