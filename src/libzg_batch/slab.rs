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

/// The element type of one slab field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    Float32,
    Int32,
    Int64
}

/// One named field of a slab: `stride` values of `ty` per sample.
#[derive(Clone, Debug)]
pub struct FieldSpec {
    pub name: String,
    pub ty: FieldType,
    pub stride: usize
}

impl FieldSpec {
    pub fn new(name: &str, ty: FieldType, stride: usize) -> Self {
        Self { name: name.to_string(), ty, stride }
    }
}

enum FieldBuf {
    F32(Vec<f32>),
    I32(Vec<i32>),
    I64(Vec<i64>)
}

/// A read-only view of one sample of one field.
pub enum FieldSlice<'a> {
    F32(&'a [f32]),
    I32(&'a [i32]),
    I64(&'a [i64])
}

impl<'a> FieldSlice<'a> {
    pub fn as_f32(&self) -> &[f32] {
        match self {
            FieldSlice::F32(values) => values,
            _ => panic!("field is not float32")
        }
    }

    pub fn as_i32(&self) -> &[i32] {
        match self {
            FieldSlice::I32(values) => values,
            _ => panic!("field is not int32")
        }
    }

    pub fn as_i64(&self) -> &[i64] {
        match self {
            FieldSlice::I64(values) => values,
            _ => panic!("field is not int64")
        }
    }
}

/// A writable view of one sample of one field.
pub enum FieldSliceMut<'a> {
    F32(&'a mut [f32]),
    I32(&'a mut [i32]),
    I64(&'a mut [i64])
}

impl<'a> FieldSliceMut<'a> {
    pub fn as_f32(&mut self) -> &mut [f32] {
        match self {
            FieldSliceMut::F32(values) => values,
            _ => panic!("field is not float32")
        }
    }

    pub fn as_i32(&mut self) -> &mut [i32] {
        match self {
            FieldSliceMut::I32(values) => values,
            _ => panic!("field is not int32")
        }
    }

    pub fn as_i64(&mut self) -> &mut [i64] {
        match self {
            FieldSliceMut::I64(values) => values,
            _ => panic!("field is not int64")
        }
    }
}

/// A dense `[batch, ...]` tensor per registered field, plus the header
/// the collector fills in.
pub struct Slab {
    specs: Arc<Vec<FieldSpec>>,
    bufs: Vec<FieldBuf>,
    batch_size: usize,
    effective_batch_size: usize,
    label: String
}

impl Slab {
    /// # Arguments
    ///
    /// * `specs` -
    /// * `batch_size` - the number of samples this slab can hold
    /// * `label` -
    ///
    pub fn new(specs: Arc<Vec<FieldSpec>>, batch_size: usize, label: &str) -> Self {
        let bufs = specs.iter()
            .map(|spec| {
                let len = spec.stride * batch_size;

                match spec.ty {
                    FieldType::Float32 => FieldBuf::F32(vec! [0.0; len]),
                    FieldType::Int32 => FieldBuf::I32(vec! [0; len]),
                    FieldType::Int64 => FieldBuf::I64(vec! [0; len])
                }
            })
            .collect();

        Self {
            specs: specs,
            bufs: bufs,
            batch_size: batch_size,
            effective_batch_size: 0,
            label: label.to_string()
        }
    }

    pub fn specs(&self) -> &[FieldSpec] {
        &self.specs
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn effective_batch_size(&self) -> usize {
        self.effective_batch_size
    }

    pub fn set_effective_batch_size(&mut self, n: usize) {
        debug_assert!(n <= self.batch_size);
        self.effective_batch_size = n;
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.specs.iter().position(|spec| spec.name == name)
    }

    /// Borrow one sample of one field.
    ///
    /// # Arguments
    ///
    /// * `field` -
    /// * `row` -
    ///
    pub fn field(&self, field: usize, row: usize) -> FieldSlice {
        let stride = self.specs[field].stride;
        let range = row * stride..(row + 1) * stride;

        match &self.bufs[field] {
            FieldBuf::F32(values) => FieldSlice::F32(&values[range]),
            FieldBuf::I32(values) => FieldSlice::I32(&values[range]),
            FieldBuf::I64(values) => FieldSlice::I64(&values[range])
        }
    }

    /// Borrow one sample of one field mutably.
    ///
    /// # Arguments
    ///
    /// * `field` -
    /// * `row` -
    ///
    pub fn field_mut(&mut self, field: usize, row: usize) -> FieldSliceMut {
        let stride = self.specs[field].stride;
        let range = row * stride..(row + 1) * stride;

        match &mut self.bufs[field] {
            FieldBuf::F32(values) => FieldSliceMut::F32(&mut values[range]),
            FieldBuf::I32(values) => FieldSliceMut::I32(&mut values[range]),
            FieldBuf::I64(values) => FieldSliceMut::I64(&mut values[range])
        }
    }

    /// Copy one sample of every field from `src`.
    ///
    /// # Arguments
    ///
    /// * `dst_row` -
    /// * `src` -
    /// * `src_row` -
    ///
    pub fn copy_row_from(&mut self, dst_row: usize, src: &Slab, src_row: usize) {
        debug_assert_eq!(self.specs.len(), src.specs.len());

        for field in 0..self.specs.len() {
            let stride = self.specs[field].stride;
            let src_range = src_row * stride..(src_row + 1) * stride;
            let dst_range = dst_row * stride..(dst_row + 1) * stride;

            match (&mut self.bufs[field], &src.bufs[field]) {
                (FieldBuf::F32(dst), FieldBuf::F32(src)) => {
                    dst[dst_range].copy_from_slice(&src[src_range]);
                },
                (FieldBuf::I32(dst), FieldBuf::I32(src)) => {
                    dst[dst_range].copy_from_slice(&src[src_range]);
                },
                (FieldBuf::I64(dst), FieldBuf::I64(src)) => {
                    dst[dst_range].copy_from_slice(&src[src_range]);
                },
                _ => panic!("field type mismatch")
            }
        }
    }
}
