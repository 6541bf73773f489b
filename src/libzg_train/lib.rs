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
extern crate rand;
extern crate serde;
extern crate serde_json;
extern crate zg_batch;
extern crate zg_go;
extern crate zg_mcts;
extern crate zg_utils;

/* -------- Modules -------- */

pub mod actor;
pub mod client;
pub mod client_manager;
pub mod ctrl_eval;
pub mod ctrl_selfplay;
pub mod dispatcher;
pub mod fair_pick;
pub mod options;
pub mod record;
pub mod record_io;
pub mod replay;
pub mod resign;
pub mod server;
pub mod transport;

/* -------- Exports -------- */

pub use self::options::GameOptions;
pub use self::record::*;
