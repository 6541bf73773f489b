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
extern crate zg_utils;

/* -------- Modules -------- */

pub mod batcher;
pub mod extractor;
pub mod slab;

/* -------- Exports -------- */

pub use self::batcher::{Batch, BatchOptions, Batcher, Evaluator, RandomEvaluator, ReplyStatus, ServiceHandle};
pub use self::extractor::Extractor;
pub use self::slab::{FieldSlice, FieldSliceMut, FieldSpec, FieldType, Slab};
