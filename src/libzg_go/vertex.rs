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

use crate::{NUM_VERTICES, SIZE};

/// A point on the board, or the pass move. Identified by its index into the
/// row-major vertex array, with `NUM_VERTICES` reserved for pass.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Vertex(u16);

impl Vertex {
    /// The pass move.
    pub const PASS: Vertex = Vertex(NUM_VERTICES as u16);

    pub fn new(x: usize, y: usize) -> Vertex {
        debug_assert!(x < SIZE && y < SIZE);

        Vertex((y * SIZE + x) as u16)
    }

    pub fn from_index(index: usize) -> Vertex {
        debug_assert!(index <= NUM_VERTICES);

        Vertex(index as u16)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_pass(self) -> bool {
        self == Vertex::PASS
    }

    pub fn x(self) -> usize {
        self.0 as usize % SIZE
    }

    pub fn y(self) -> usize {
        self.0 as usize / SIZE
    }

    /// Returns an iterator over every playable vertex on the board.
    pub fn all() -> impl Iterator<Item=Vertex> {
        (0..NUM_VERTICES).map(Vertex::from_index)
    }

    /// Returns the orthogonal neighbours of this vertex.
    pub fn neighbours(self) -> impl Iterator<Item=Vertex> {
        let (x, y) = (self.x() as isize, self.y() as isize);

        [(0, -1), (-1, 0), (1, 0), (0, 1)].into_iter()
            .map(move |(dx, dy)| (x + dx, y + dy))
            .filter(|&(x, y)| x >= 0 && y >= 0 && (x as usize) < SIZE && (y as usize) < SIZE)
            .map(|(x, y)| Vertex::new(x as usize, y as usize))
    }
}

impl fmt::Debug for Vertex {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.is_pass() {
            write!(fmt, "pass")
        } else {
            write!(fmt, "({}, {})", self.x(), self.y())
        }
    }
}

impl fmt::Display for Vertex {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.is_pass() {
            write!(fmt, "pass")
        } else {
            // skip `I` as tradition demands
            let column = (b'A' + self.x() as u8 + (self.x() >= 8) as u8) as char;

            write!(fmt, "{}{}", column, self.y() + 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corner_has_two_neighbours() {
        assert_eq!(Vertex::new(0, 0).neighbours().count(), 2);
        assert_eq!(Vertex::new(SIZE - 1, SIZE - 1).neighbours().count(), 2);
    }

    #[test]
    fn middle_has_four_neighbours() {
        assert_eq!(Vertex::new(4, 4).neighbours().count(), 4);
    }

    #[test]
    fn round_trip() {
        for vertex in Vertex::all() {
            assert_eq!(Vertex::new(vertex.x(), vertex.y()), vertex);
        }
    }

    #[test]
    fn display() {
        assert_eq!(format!("{}", Vertex::new(0, 0)), "A1");
        assert_eq!(format!("{}", Vertex::new(8, 8)), "J9");
        assert_eq!(format!("{}", Vertex::PASS), "pass");
    }
}
