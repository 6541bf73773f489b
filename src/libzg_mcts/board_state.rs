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

//! The search contract implemented for the bundled Go board.

use crate::base::{GameAction, GameState};
use zg_go::{features, Board, Color, Vertex, NUM_VERTICES, SIZE};

impl GameAction for Vertex {
    fn default_value() -> Self {
        Vertex::PASS
    }

    fn policy_index(&self) -> usize {
        self.index()
    }
}

impl GameState for Board {
    type Action = Vertex;

    fn to_move(&self) -> usize {
        Board::to_move(self).index()
    }

    fn terminated(&self) -> bool {
        Board::terminated(self)
    }

    fn forward(&mut self, action: Vertex) -> bool {
        self.place(action)
    }

    fn legal_actions(&self) -> Vec<Vertex> {
        self.legal_moves(Board::to_move(self))
    }

    fn feature_shape() -> (usize, usize, usize) {
        (features::NUM_FEATURES, SIZE, SIZE)
    }

    fn features(&self, out: &mut [f32]) {
        features::extract(self, out)
    }

    fn hash(&self) -> u64 {
        Board::hash(self)
    }

    fn evaluate(&self) -> f32 {
        Board::evaluate(self)
    }

    fn moves_since(&self, other: &Board) -> Option<Vec<Vertex>> {
        Board::moves_since(self, other)
    }
}

/// Returns true when the player to move is minimizing in the global
/// convention, which for Go is white.
pub fn q_flip_for(board: &Board) -> bool {
    Board::to_move(board) == Color::White
}
