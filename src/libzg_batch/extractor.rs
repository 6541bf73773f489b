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

use std::sync::Arc;

use crate::slab::{FieldSlice, FieldSliceMut, FieldSpec, FieldType, Slab};

type WriteFn<E> = Box<dyn Fn(&E, FieldSliceMut) + Send + Sync>;
type ReadFn<R> = Box<dyn Fn(&mut R, FieldSlice) + Send + Sync>;

struct InputField<E> {
    spec: FieldSpec,
    write: WriteFn<E>
}

struct OutputField<R> {
    spec: FieldSpec,
    read: ReadFn<R>
}

/// The schema registry tying slab fields to entity types: each input field
/// knows how to serialize itself out of a request entity `E`, each output
/// field how to deposit itself into a reply entity `R`. Registration
/// happens once, at startup, after which the tensor layout is fixed.
pub struct Extractor<E, R> {
    inputs: Vec<InputField<E>>,
    outputs: Vec<OutputField<R>>
}

impl<E, R> Default for Extractor<E, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, R> Extractor<E, R> {
    pub fn new() -> Self {
        Self { inputs: vec! [], outputs: vec! [] }
    }

    /// Register an input field.
    ///
    /// # Arguments
    ///
    /// * `name` -
    /// * `ty` -
    /// * `stride` - values per sample
    /// * `write` - serializes the field out of a request entity
    ///
    pub fn input<F>(mut self, name: &str, ty: FieldType, stride: usize, write: F) -> Self
        where F: Fn(&E, FieldSliceMut) + Send + Sync + 'static
    {
        debug_assert!(self.inputs.iter().all(|f| f.spec.name != name));

        self.inputs.push(InputField {
            spec: FieldSpec::new(name, ty, stride),
            write: Box::new(write)
        });
        self
    }

    /// Register an output field.
    ///
    /// # Arguments
    ///
    /// * `name` -
    /// * `ty` -
    /// * `stride` - values per sample
    /// * `read` - deposits the field into a reply entity
    ///
    pub fn output<F>(mut self, name: &str, ty: FieldType, stride: usize, read: F) -> Self
        where F: Fn(&mut R, FieldSlice) + Send + Sync + 'static
    {
        debug_assert!(self.outputs.iter().all(|f| f.spec.name != name));

        self.outputs.push(OutputField {
            spec: FieldSpec::new(name, ty, stride),
            read: Box::new(read)
        });
        self
    }

    pub fn input_specs(&self) -> Arc<Vec<FieldSpec>> {
        Arc::new(self.inputs.iter().map(|f| f.spec.clone()).collect())
    }

    pub fn output_specs(&self) -> Arc<Vec<FieldSpec>> {
        Arc::new(self.outputs.iter().map(|f| f.spec.clone()).collect())
    }

    /// Run every registered input writer for one entity against one slab
    /// row.
    ///
    /// # Arguments
    ///
    /// * `entity` -
    /// * `slab` -
    /// * `row` -
    ///
    pub fn write_entity(&self, entity: &E, slab: &mut Slab, row: usize) {
        for (field, input) in self.inputs.iter().enumerate() {
            (input.write)(entity, slab.field_mut(field, row));
        }
    }

    /// Run every registered output reader for one slab row against one
    /// reply entity.
    ///
    /// # Arguments
    ///
    /// * `reply` -
    /// * `slab` -
    /// * `row` -
    ///
    pub fn read_entity(&self, reply: &mut R, slab: &Slab, row: usize) {
        for (field, output) in self.outputs.iter().enumerate() {
            (output.read)(reply, slab.field(field, row));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Request {
        features: Vec<f32>
    }

    #[derive(Default)]
    struct Reply {
        value: f32,
        version: i64
    }

    fn extractor() -> Extractor<Request, Reply> {
        Extractor::new()
            .input("s", FieldType::Float32, 3, |req: &Request, mut dst| {
                dst.as_f32().copy_from_slice(&req.features);
            })
            .output("v", FieldType::Float32, 1, |reply: &mut Reply, src| {
                reply.value = src.as_f32()[0];
            })
            .output("rv", FieldType::Int64, 1, |reply: &mut Reply, src| {
                reply.version = src.as_i64()[0];
            })
    }

    #[test]
    fn writes_and_reads_round_trip() {
        let ex = extractor();
        let mut input = Slab::new(ex.input_specs(), 2, "in");
        let mut output = Slab::new(ex.output_specs(), 2, "out");

        ex.write_entity(&Request { features: vec! [1.0, 2.0, 3.0] }, &mut input, 1);
        assert_eq!(input.field(0, 1).as_f32(), &[1.0, 2.0, 3.0]);

        output.field_mut(0, 1).as_f32()[0] = 0.25;
        output.field_mut(1, 1).as_i64()[0] = 9;

        let mut reply = Reply::default();

        ex.read_entity(&mut reply, &output, 1);
        assert_eq!(reply.value, 0.25);
        assert_eq!(reply.version, 9);
    }

    #[test]
    fn specs_follow_registration_order() {
        let ex = extractor();

        assert_eq!(ex.input_specs().len(), 1);
        assert_eq!(ex.output_specs()[0].name, "v");
        assert_eq!(ex.output_specs()[1].name, "rv");
    }
}
