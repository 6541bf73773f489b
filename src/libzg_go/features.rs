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

use crate::{Board, Color, Vertex, NUM_VERTICES};

/// The number of input planes fed to the evaluator.
pub const NUM_FEATURES: usize = 4;

/// The total number of values in one feature tensor.
pub const FEATURE_SIZE: usize = NUM_FEATURES * NUM_VERTICES;

/// The number of entries in the policy head, one per vertex plus pass.
pub const POLICY_SIZE: usize = NUM_VERTICES + 1;

/// Write the feature tensor for the player to move into `out`, laid out as
/// `[plane, y, x]`:
///
/// 0. stones of the player to move
/// 1. stones of the opponent
/// 2. the most recent move, if any
/// 3. all ones when black is to move
///
/// # Arguments
///
/// * `board` -
/// * `out` -
///
pub fn extract(board: &Board, out: &mut [f32]) {
    debug_assert_eq!(out.len(), FEATURE_SIZE);

    let to_move = board.to_move();

    for value in out.iter_mut() {
        *value = 0.0;
    }

    for vertex in Vertex::all() {
        match board.at(vertex) {
            Some(color) if color == to_move => { out[vertex.index()] = 1.0; },
            Some(_) => { out[NUM_VERTICES + vertex.index()] = 1.0; },
            None => {}
        }
    }

    if let Some(last) = board.last_move() {
        if !last.is_pass() {
            out[2 * NUM_VERTICES + last.index()] = 1.0;
        }
    }

    if to_move == Color::Black {
        for i in 0..NUM_VERTICES {
            out[3 * NUM_VERTICES + i] = 1.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_board() {
        let board = Board::new(7.5);
        let mut out = vec! [0.0; FEATURE_SIZE];

        extract(&board, &mut out);

        assert!(out[..2 * NUM_VERTICES].iter().all(|&x| x == 0.0));
        assert!(out[3 * NUM_VERTICES..].iter().all(|&x| x == 1.0));
    }

    #[test]
    fn planes_follow_the_player_to_move() {
        let mut board = Board::new(7.5);
        let mut out = vec! [0.0; FEATURE_SIZE];

        assert!(board.place(Vertex::new(2, 3)));
        extract(&board, &mut out);

        // white to move, so the black stone sits in the opponent plane
        let index = Vertex::new(2, 3).index();

        assert_eq!(out[index], 0.0);
        assert_eq!(out[NUM_VERTICES + index], 1.0);
        assert_eq!(out[2 * NUM_VERTICES + index], 1.0);
        assert!(out[3 * NUM_VERTICES..].iter().all(|&x| x == 0.0));
    }
}
