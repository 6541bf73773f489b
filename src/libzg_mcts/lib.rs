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

extern crate crossbeam_channel;
#[macro_use] extern crate log;
extern crate ordered_float;
extern crate rand;
extern crate rand_distr;
extern crate serde;
extern crate zg_go;
extern crate zg_utils;

/* -------- Modules -------- */

pub mod base;
pub mod board_state;
mod dirichlet;
pub mod mcts;
pub mod options;
pub mod result;
pub mod search;
pub mod tree;

/* -------- Exports -------- */

pub use self::base::*;
pub use self::mcts::MctsAi;
pub use self::result::{EdgeSnapshot, MctsPolicy, MctsResult};
pub use self::search::TreeSearch;
