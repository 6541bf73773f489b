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

#[macro_use] extern crate lazy_static;
extern crate rand;

mod board;
mod color;
pub mod features;
mod vertex;
mod zobrist;

pub use self::board::*;
pub use self::color::*;
pub use self::vertex::*;

/// The width (and height) of the board.
pub const SIZE: usize = 9;

/// The number of playable vertices on the board.
pub const NUM_VERTICES: usize = SIZE * SIZE;

/// The maximum number of moves in a game before it is scored as-is.
pub const MAX_PLY: usize = 2 * NUM_VERTICES;
