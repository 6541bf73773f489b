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

use serde::{Deserialize, Serialize};

use zg_go::{Vertex, SIZE};
use zg_mcts::options::SearchOptions;

/// The pair of model versions a game is played with. `black_ver < 0` is a
/// wait order, `white_ver == -1` self-play, both `>= 0` an evaluation
/// match.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelPair {
    pub black_ver: i64,
    pub white_ver: i64,
    pub mcts_opt: SearchOptions
}

impl Default for ModelPair {
    fn default() -> Self {
        Self {
            black_ver: -1,
            white_ver: -1,
            mcts_opt: SearchOptions::default()
        }
    }
}

impl ModelPair {
    pub fn wait(&self) -> bool {
        self.black_ver < 0
    }

    pub fn set_wait(&mut self) {
        self.black_ver = -1;
        self.white_ver = -1;
    }

    pub fn is_selfplay(&self) -> bool {
        self.black_ver >= 0 && self.white_ver == -1
    }

    pub fn is_evaluation(&self) -> bool {
        self.black_ver >= 0 && self.white_ver >= 0
    }
}

impl fmt::Display for ModelPair {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.wait() {
            write!(fmt, "[wait]")
        } else if self.is_selfplay() {
            write!(fmt, "[selfplay={}]", self.black_ver)
        } else {
            write!(fmt, "[b={}][w={}]", self.black_ver, self.white_ver)
        }
    }
}

/// The kind of worker a client is scheduled as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    SelfplayOnly,
    EvalThenSelfplay
}

/// One work order from the server. Two requests are the same game session
/// iff their model pair, side swap and async flag agree, everything else
/// can change without a restart.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub vers: ModelPair,
    pub resign_thres: f32,
    pub never_resign_prob: f32,
    pub player_swap: bool,
    pub async_mode: bool,
    pub num_game_thread_used: i32,
    pub client_type: ClientType
}

impl Default for Request {
    fn default() -> Self {
        Self {
            vers: ModelPair::default(),
            resign_thres: 0.0,
            never_resign_prob: 0.0,
            player_swap: false,
            async_mode: false,
            num_game_thread_used: -1,
            client_type: ClientType::SelfplayOnly
        }
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.vers == other.vers
            && self.player_swap == other.player_swap
            && self.async_mode == other.async_mode
    }
}

impl Request {
    /// A request that tells the client to idle and keep heartbeating.
    pub fn wait() -> Self {
        Self::default()
    }
}

/// A request paired with the per-client sequence number.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestSeq {
    pub request: Request,
    pub seq: i64
}

/// A compact liveness ping describing what one game thread is doing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadState {
    pub thread_id: usize,
    pub seq: usize,
    pub move_idx: usize,
    pub black_ver: i64,
    pub white_ver: i64
}

/// One recorded search policy, sparse over the policy head, with the
/// weights quantized to a byte.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SparsePolicy {
    pub entries: Vec<(u16, u8)>
}

impl SparsePolicy {
    /// Quantize the given normalized `(policy index, weight)` pairs,
    /// scaling so the strongest entry maps to 255.
    ///
    /// # Arguments
    ///
    /// * `weights` -
    ///
    pub fn quantize(weights: &[(usize, f32)]) -> Self {
        let max_weight = weights.iter()
            .map(|&(_, w)| w)
            .fold(0.0f32, f32::max);

        if max_weight <= 0.0 {
            return Self::default();
        }

        Self {
            entries: weights.iter()
                .filter(|&&(_, w)| w > 0.0)
                .map(|&(i, w)| (i as u16, (w / max_weight * 255.0) as u8))
                .collect()
        }
    }
}

/// The outcome of one finished game.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GameResult {
    /// `+1` black win, `-1` white win, `0` drawn.
    pub reward: f32,

    /// The move sequence, two letters per move.
    pub content: String,

    /// Every model version that contributed a reply to this game.
    pub using_models: Vec<i64>,

    /// The search policy of each recorded ply.
    pub policies: Vec<SparsePolicy>,

    /// The predicted value at each ply, from black's point of view.
    pub values: Vec<f32>,

    pub num_moves: usize,
    pub black_never_resign: bool,
    pub white_never_resign: bool
}

/// One self-contained game record as shipped to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub timestamp: u64,
    pub thread_id: usize,
    pub seq: usize,
    pub request: Request,
    pub result: GameResult
}

/// A batch of records plus the per-thread heartbeats, tagged with the
/// client identity.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Records {
    pub identity: String,
    pub records: Vec<Record>,
    pub states: Vec<ThreadState>
}

impl Records {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            records: vec! [],
            states: vec! []
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Replace (or add) the heartbeat of one thread.
    ///
    /// # Arguments
    ///
    /// * `state` -
    ///
    pub fn update_state(&mut self, state: ThreadState) {
        match self.states.iter_mut().find(|s| s.thread_id == state.thread_id) {
            Some(entry) => { *entry = state; },
            None => { self.states.push(state); }
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.states.clear();
    }
}

/// What happened to a record when it was fed into a sub-controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedResult {
    Feeded,
    NotSelfplay,
    NotEval,
    VersionMismatch,
    NotRequested
}

/// How a game thread reacted to a request broadcast.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartReply {
    OnlyWait,
    UpdateRequestOnly,
    UpdateModel,
    UpdateModelAsync,
    UpdateComplete
}

/// Encode a move sequence as two letters per move, `zz` for pass.
///
/// # Arguments
///
/// * `moves` -
///
pub fn moves_to_string(moves: &[Vertex]) -> String {
    let mut out = String::with_capacity(2 * moves.len());

    for &vertex in moves {
        if vertex.is_pass() {
            out.push_str("zz");
        } else {
            out.push((b'a' + vertex.x() as u8) as char);
            out.push((b'a' + vertex.y() as u8) as char);
        }
    }
    out
}

/// Decode a move sequence produced by `moves_to_string`.
///
/// # Arguments
///
/// * `content` -
///
pub fn string_to_moves(content: &str) -> Option<Vec<Vertex>> {
    let bytes = content.as_bytes();

    if bytes.len() % 2 != 0 {
        return None;
    }

    bytes.chunks(2)
        .map(|pair| {
            if pair == &b"zz"[..] {
                Some(Vertex::PASS)
            } else {
                let x = pair[0].checked_sub(b'a')? as usize;
                let y = pair[1].checked_sub(b'a')? as usize;

                if x < SIZE && y < SIZE {
                    Some(Vertex::new(x, y))
                } else {
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_pair_classification() {
        let mut pair = ModelPair::default();

        assert!(pair.wait());
        pair.black_ver = 3;
        assert!(pair.is_selfplay());
        pair.white_ver = 2;
        assert!(pair.is_evaluation());
        pair.set_wait();
        assert!(pair.wait());
    }

    #[test]
    fn request_identity_ignores_thresholds() {
        let mut a = Request::default();
        let mut b = Request::default();

        b.resign_thres = 0.1;
        b.never_resign_prob = 0.5;
        b.num_game_thread_used = 4;
        assert_eq!(a, b);

        a.player_swap = true;
        assert_ne!(a, b);

        a.player_swap = false;
        a.async_mode = true;
        assert_ne!(a, b);

        a.async_mode = false;
        a.vers.black_ver = 1;
        assert_ne!(a, b);
    }

    #[test]
    fn record_serde_is_idempotent() {
        let record = Record {
            timestamp: 1234,
            thread_id: 3,
            seq: 7,
            request: Request {
                vers: ModelPair { black_ver: 5, white_ver: -1, ..Default::default() },
                resign_thres: 0.05,
                ..Default::default()
            },
            result: GameResult {
                reward: 1.0,
                content: "aabbzz".to_string(),
                using_models: vec! [5],
                policies: vec! [SparsePolicy { entries: vec! [(0, 255), (81, 17)] }],
                values: vec! [0.25, -0.5],
                num_moves: 3,
                black_never_resign: true,
                white_never_resign: true
            }
        };

        let first = serde_json::to_string(&record).unwrap();
        let parsed: Record = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string(&parsed).unwrap();

        assert_eq!(first, second);
        assert_eq!(record.result, parsed.result);
    }

    #[test]
    fn move_string_round_trip() {
        let moves = vec! [
            Vertex::new(0, 0),
            Vertex::new(8, 8),
            Vertex::PASS,
            Vertex::new(4, 2),
        ];
        let content = moves_to_string(&moves);

        assert_eq!(content, "aaiizzec");
        assert_eq!(string_to_moves(&content), Some(moves));
    }

    #[test]
    fn malformed_move_strings_are_rejected() {
        assert_eq!(string_to_moves("a"), None);
        assert_eq!(string_to_moves("ا٢"), None);
    }

    #[test]
    fn sparse_policy_scales_to_full_range() {
        let policy = SparsePolicy::quantize(&[(3, 0.5), (9, 0.25), (11, 0.0)]);

        assert_eq!(policy.entries, vec! [(3, 255), (9, 127)]);
    }

    #[test]
    fn heartbeats_replace_by_thread() {
        let mut records = Records::new("client-1");

        records.update_state(ThreadState { thread_id: 1, move_idx: 5, ..Default::default() });
        records.update_state(ThreadState { thread_id: 2, move_idx: 1, ..Default::default() });
        records.update_state(ThreadState { thread_id: 1, move_idx: 9, ..Default::default() });

        assert_eq!(records.states.len(), 2);
        assert_eq!(records.states[0].move_idx, 9);
    }
}
