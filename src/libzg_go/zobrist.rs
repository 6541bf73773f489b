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

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::NUM_VERTICES;

lazy_static! {
    /// One key per (color, vertex) pair.
    pub static ref KEYS: [[u64; NUM_VERTICES]; 2] = {
        let mut rng = SmallRng::seed_from_u64(0x5eed_90b0_a2d5_1234);
        let mut keys = [[0; NUM_VERTICES]; 2];

        for color in keys.iter_mut() {
            for key in color.iter_mut() {
                *key = rng.gen();
            }
        }

        keys
    };

    /// Mixed in when it is white to move.
    pub static ref TURN: u64 = SmallRng::seed_from_u64(0x5eed_90b0_f00d_5678).gen();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_distinct() {
        for i in 0..NUM_VERTICES {
            assert_ne!(KEYS[0][i], KEYS[1][i]);
            assert_ne!(KEYS[0][i], 0);
        }
    }
}
