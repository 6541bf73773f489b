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

use rand::Rng;
use rand_distr::{Distribution, Gamma};

/// Draw one sample from a `Dirichlet(alpha)` distribution of the given
/// dimension, by normalizing independent gamma draws.
///
/// # Arguments
///
/// * `alpha` -
/// * `count` -
/// * `rng` -
///
pub fn sample<R: Rng>(alpha: f32, count: usize, rng: &mut R) -> Vec<f32> {
    let gamma = Gamma::new(alpha as f64, 1.0).expect("invalid dirichlet alpha");
    let mut etas = (0..count)
        .map(|_| gamma.sample(rng) as f32)
        .collect::<Vec<_>>();
    let total = etas.iter().sum::<f32>() + 1e-10;

    for eta in etas.iter_mut() {
        *eta /= total;
    }
    etas
}
