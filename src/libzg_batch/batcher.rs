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

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use rand::Rng;

use crate::extractor::Extractor;
use crate::slab::{FieldSpec, FieldType, Slab};
use zg_utils::config;

/// The outcome of one evaluation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyStatus {
    Success,
    Failed,
    Unknown
}

impl ReplyStatus {
    /// Combine two statuses, keeping the worse one.
    pub fn and(self, other: ReplyStatus) -> ReplyStatus {
        match (self, other) {
            (ReplyStatus::Success, ReplyStatus::Success) => ReplyStatus::Success,
            (ReplyStatus::Failed, _) | (_, ReplyStatus::Failed) => ReplyStatus::Failed,
            _ => ReplyStatus::Unknown
        }
    }
}

/// Geometry and deadline of one rendezvous channel.
#[derive(Clone, Debug)]
pub struct BatchOptions {
    pub label: String,
    pub min_batch: usize,
    pub max_batch: usize,
    pub timeout_us: u64
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            label: "actor".to_string(),
            min_batch: *config::MIN_BATCH_SIZE,
            max_batch: *config::BATCH_SIZE,
            timeout_us: *config::BATCH_TIMEOUT_US
        }
    }
}

type SlotReply = Result<(Arc<Slab>, usize), ReplyStatus>;

struct FillState {
    input: Slab,
    senders: Vec<Sender<SlotReply>>
}

struct Inner<E, R> {
    extractor: Extractor<E, R>,
    options: BatchOptions,
    input_specs: Arc<Vec<FieldSpec>>,
    output_specs: Arc<Vec<FieldSpec>>,
    state: Mutex<FillState>,
    collect_cv: Condvar,
    space_cv: Condvar,
    done: AtomicBool
}

/// The game ↔ evaluator rendezvous. Producer threads claim one slot per
/// sample, write their input fields, and suspend on a per-slot latch; the
/// consumer side gathers `[min_batch, max_batch]` slots (giving up earlier
/// on timeout) and wakes every slot of a batch at once. The same type
/// serves both directions: the collector channel has the games producing,
/// the dispatcher channel has the remote side producing.
pub struct Batcher<E, R> {
    inner: Arc<Inner<E, R>>
}

impl<E, R> Clone for Batcher<E, R> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<E, R> Batcher<E, R> {
    /// # Arguments
    ///
    /// * `extractor` - the field registry, fixed for the batcher's lifetime
    /// * `options` -
    ///
    pub fn new(extractor: Extractor<E, R>, options: BatchOptions) -> Self {
        assert!(options.max_batch > 0);
        assert!(options.min_batch <= options.max_batch);

        let input_specs = extractor.input_specs();
        let output_specs = extractor.output_specs();
        let input = Slab::new(input_specs.clone(), options.max_batch, &options.label);

        Self {
            inner: Arc::new(Inner {
                extractor: extractor,
                options: options,
                input_specs: input_specs,
                output_specs: output_specs,
                state: Mutex::new(FillState { input: input, senders: vec! [] }),
                collect_cv: Condvar::new(),
                space_cv: Condvar::new(),
                done: AtomicBool::new(false)
            })
        }
    }

    pub fn options(&self) -> &BatchOptions {
        &self.inner.options
    }

    /// Claim a slot, ship `entity`, and suspend until the reply for that
    /// slot arrives (or the deadline passes). On success the output fields
    /// have been deposited into `reply`.
    ///
    /// # Arguments
    ///
    /// * `entity` -
    /// * `reply` -
    ///
    pub fn send_wait(&self, entity: &E, reply: &mut R) -> ReplyStatus {
        // serialize the sample outside of any lock
        let mut scratch = Slab::new(self.inner.input_specs.clone(), 1, &self.inner.options.label);

        self.inner.extractor.write_entity(entity, &mut scratch, 0);

        let rx = match self.claim(&scratch) {
            Some(rx) => rx,
            None => return ReplyStatus::Failed
        };

        self.await_slot(rx, reply)
    }

    /// Ship several samples from one caller in one go. The slots may end
    /// up spread over more than one physical batch.
    ///
    /// # Arguments
    ///
    /// * `entities` -
    /// * `replies` -
    ///
    pub fn send_batch_wait(&self, entities: &[&E], replies: &mut [R]) -> ReplyStatus {
        debug_assert_eq!(entities.len(), replies.len());

        let mut scratch = Slab::new(self.inner.input_specs.clone(), 1, &self.inner.options.label);
        let mut receivers = Vec::with_capacity(entities.len());

        for entity in entities {
            self.inner.extractor.write_entity(entity, &mut scratch, 0);
            receivers.push(self.claim(&scratch));
        }

        let mut status = ReplyStatus::Success;

        for (rx, reply) in receivers.into_iter().zip(replies.iter_mut()) {
            let slot_status = match rx {
                Some(rx) => self.await_slot(rx, reply),
                None => ReplyStatus::Failed
            };

            status = status.and(slot_status);
        }
        status
    }

    /// Like `send_batch_wait`, but split into sub-batches of fixed size
    /// with a callback fired as each sub-reply lands. Used when one logical
    /// batch holds more rollouts than one physical batch can.
    ///
    /// # Arguments
    ///
    /// * `entities` -
    /// * `replies` -
    /// * `sub_batch` -
    /// * `on_sub_batch` -
    ///
    pub fn send_batches_wait<F>(
        &self,
        entities: &[&E],
        replies: &mut [R],
        sub_batch: usize,
        mut on_sub_batch: F
    ) -> ReplyStatus
        where F: FnMut(Range<usize>, ReplyStatus)
    {
        debug_assert_eq!(entities.len(), replies.len());

        let sub_batch = zg_utils::max(sub_batch, 1);
        let mut status = ReplyStatus::Success;
        let mut start = 0;

        while start < entities.len() {
            let end = zg_utils::min(start + sub_batch, entities.len());
            let sub_status = self.send_batch_wait(
                &entities[start..end],
                &mut replies[start..end]
            );

            on_sub_batch(start..end, sub_status);
            status = status.and(sub_status);
            start = end;
        }
        status
    }

    /// Consumer side: block until a batch is ready (or `shutdown` was
    /// called). The returned batch owns the filled input slab.
    pub fn wait_batch(&self) -> Option<Batch> {
        let inner = &*self.inner;
        let timeout = Duration::from_micros(inner.options.timeout_us);
        let mut state = inner.state.lock().expect("could not acquire batch lock");

        loop {
            if inner.done.load(Ordering::Acquire) {
                return None;
            }

            let filled = state.senders.len();

            if filled >= zg_utils::max(inner.options.min_batch, 1) {
                break;
            }

            if filled > 0 {
                // a short batch is better than a stale one
                let (next, wait) = inner.collect_cv
                    .wait_timeout(state, timeout)
                    .expect("could not wait for batch");

                state = next;
                if wait.timed_out() && !state.senders.is_empty() {
                    break;
                }
            } else {
                let (next, _) = inner.collect_cv
                    .wait_timeout(state, Duration::from_millis(10))
                    .expect("could not wait for batch");

                state = next;
            }
        }

        let effective = state.senders.len();
        let mut input = std::mem::replace(
            &mut state.input,
            Slab::new(inner.input_specs.clone(), inner.options.max_batch, &inner.options.label)
        );

        input.set_effective_batch_size(effective);

        let senders = std::mem::take(&mut state.senders);

        drop(state);
        inner.space_cv.notify_all();

        Some(Batch {
            input: input,
            senders: senders,
            output_specs: inner.output_specs.clone(),
            label: inner.options.label.clone()
        })
    }

    /// Stop the rendezvous: pending and future requests fail, and
    /// `wait_batch` returns `None` so service loops unwind.
    pub fn shutdown(&self) {
        self.inner.done.store(true, Ordering::Release);

        let mut state = self.inner.state.lock().expect("could not acquire batch lock");

        for tx in state.senders.drain(..) {
            tx.send(Err(ReplyStatus::Failed)).ok();
        }
        drop(state);

        self.inner.collect_cv.notify_all();
        self.inner.space_cv.notify_all();
    }

    fn claim(&self, scratch: &Slab) -> Option<Receiver<SlotReply>> {
        let inner = &*self.inner;
        let deadline = std::time::Instant::now() + Duration::from_micros(inner.options.timeout_us);
        let mut state = inner.state.lock().expect("could not acquire batch lock");

        loop {
            if inner.done.load(Ordering::Acquire) {
                return None;
            }
            if state.senders.len() < inner.options.max_batch {
                break;
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }

            let (next, _) = inner.space_cv
                .wait_timeout(state, Duration::from_millis(100))
                .expect("could not wait for batch space");

            state = next;
        }

        let row = state.senders.len();

        state.input.copy_row_from(row, scratch, 0);

        let (tx, rx) = bounded(1);

        state.senders.push(tx);
        drop(state);
        inner.collect_cv.notify_all();
        Some(rx)
    }

    fn await_slot(&self, rx: Receiver<SlotReply>, reply: &mut R) -> ReplyStatus {
        // the consumer may sit on a partial batch for one full flush
        // interval before it even starts evaluating
        let timeout = Duration::from_micros(2 * self.inner.options.timeout_us);

        match rx.recv_timeout(timeout) {
            Ok(Ok((slab, row))) => {
                self.inner.extractor.read_entity(reply, &slab, row);
                ReplyStatus::Success
            },
            Ok(Err(status)) => status,
            Err(_) => {
                debug!("[{}] slot reply timed out", self.inner.options.label);
                ReplyStatus::Failed
            }
        }
    }
}

impl<E: 'static, R: 'static> Batcher<E, R> {
    /// Spawn the collector thread: it gathers batches, runs them through
    /// `evaluator`, and releases the waiting producers.
    ///
    /// # Arguments
    ///
    /// * `evaluator` -
    ///
    pub fn spawn_service<V: Evaluator>(&self, mut evaluator: V) -> ServiceHandle {
        let batcher = self.clone();
        let handle = thread::Builder::new()
            .name(format!("collector_{}", self.inner.options.label))
            .spawn(move || {
                while let Some(batch) = batcher.wait_batch() {
                    let mut output = batch.make_output();
                    let status = evaluator.forward(&batch.input, &mut output);

                    batch.release(output, status);
                }
            })
            .expect("could not spawn collector thread");

        ServiceHandle { handle: Some(handle) }
    }
}

/// A filled input slab together with the latches of the producers that
/// filled it.
pub struct Batch {
    pub input: Slab,
    senders: Vec<Sender<SlotReply>>,
    output_specs: Arc<Vec<FieldSpec>>,
    label: String
}

impl Batch {
    pub fn effective(&self) -> usize {
        self.input.effective_batch_size()
    }

    /// Allocate the output slab matching this batch.
    pub fn make_output(&self) -> Slab {
        let mut output = Slab::new(self.output_specs.clone(), self.effective(), &self.label);

        output.set_effective_batch_size(self.effective());
        output
    }

    /// Wake every producer of this batch. On success each producer reads
    /// its own row of `output`; otherwise they all observe `status`.
    ///
    /// # Arguments
    ///
    /// * `output` -
    /// * `status` -
    ///
    pub fn release(self, output: Slab, status: ReplyStatus) {
        if status == ReplyStatus::Success {
            let output = Arc::new(output);

            for (row, tx) in self.senders.into_iter().enumerate() {
                tx.send(Ok((output.clone(), row))).ok();
            }
        } else {
            for tx in self.senders {
                tx.send(Err(status)).ok();
            }
        }
    }
}

/// The external evaluator contract: one reply slab per input slab.
pub trait Evaluator: Send + 'static {
    fn forward(&mut self, input: &Slab, output: &mut Slab) -> ReplyStatus;
}

/// The handle of a running collector thread.
pub struct ServiceHandle {
    handle: Option<JoinHandle<()>>
}

impl ServiceHandle {
    /// Wait for the collector to unwind. Call `shutdown` on the batcher
    /// first or this blocks forever.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.join().expect("could not join collector thread");
        }
    }
}

/// An evaluator producing uniform random float fields, for smoke tests and
/// standalone runs without a trained model. Integer fields are stamped with
/// the configured model version.
pub struct RandomEvaluator {
    pub version: i64
}

impl Evaluator for RandomEvaluator {
    fn forward(&mut self, input: &Slab, output: &mut Slab) -> ReplyStatus {
        let mut rng = rand::thread_rng();

        for row in 0..input.effective_batch_size() {
            for field in 0..output.specs().len() {
                let ty = output.specs()[field].ty;

                match ty {
                    FieldType::Float32 => {
                        for value in output.field_mut(field, row).as_f32() {
                            *value = rng.gen::<f32>();
                        }
                    },
                    FieldType::Int32 => {
                        for value in output.field_mut(field, row).as_i32() {
                            *value = self.version as i32;
                        }
                    },
                    FieldType::Int64 => {
                        for value in output.field_mut(field, row).as_i64() {
                            *value = self.version;
                        }
                    }
                }
            }
        }

        ReplyStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Ask {
        value: f32
    }

    #[derive(Clone, Default)]
    struct Answer {
        value: f32,
        version: i64
    }

    fn extractor() -> Extractor<Ask, Answer> {
        Extractor::new()
            .input("x", FieldType::Float32, 1, |ask: &Ask, mut dst| {
                dst.as_f32()[0] = ask.value;
            })
            .output("y", FieldType::Float32, 1, |answer: &mut Answer, src| {
                answer.value = src.as_f32()[0];
            })
            .output("rv", FieldType::Int64, 1, |answer: &mut Answer, src| {
                answer.version = src.as_i64()[0];
            })
    }

    /// Doubles the input and stamps version 3.
    struct Doubler;

    impl Evaluator for Doubler {
        fn forward(&mut self, input: &Slab, output: &mut Slab) -> ReplyStatus {
            for row in 0..input.effective_batch_size() {
                let x = input.field(0, row).as_f32()[0];

                output.field_mut(0, row).as_f32()[0] = 2.0 * x;
                output.field_mut(1, row).as_i64()[0] = 3;
            }
            ReplyStatus::Success
        }
    }

    struct AlwaysFails;

    impl Evaluator for AlwaysFails {
        fn forward(&mut self, _input: &Slab, _output: &mut Slab) -> ReplyStatus {
            ReplyStatus::Failed
        }
    }

    fn options(min_batch: usize, max_batch: usize, timeout_us: u64) -> BatchOptions {
        BatchOptions {
            label: "test".to_string(),
            min_batch: min_batch,
            max_batch: max_batch,
            timeout_us: timeout_us
        }
    }

    #[test]
    fn send_wait_round_trip() {
        let batcher = Batcher::new(extractor(), options(1, 4, 1_000_000));
        let service = batcher.spawn_service(Doubler);
        let mut answer = Answer::default();

        assert_eq!(batcher.send_wait(&Ask { value: 21.0 }, &mut answer), ReplyStatus::Success);
        assert_eq!(answer.value, 42.0);
        assert_eq!(answer.version, 3);

        batcher.shutdown();
        service.join();
    }

    #[test]
    fn concurrent_producers_each_get_their_own_reply() {
        let batcher = Batcher::new(extractor(), options(4, 4, 1_000_000));
        let service = batcher.spawn_service(Doubler);
        let handles = (0..8).map(|i| {
            let batcher = batcher.clone();

            thread::spawn(move || {
                let mut answer = Answer::default();
                let status = batcher.send_wait(&Ask { value: i as f32 }, &mut answer);

                (status, i, answer.value)
            })
        }).collect::<Vec<_>>();

        for handle in handles {
            let (status, i, value) = handle.join().unwrap();

            assert_eq!(status, ReplyStatus::Success);
            assert_eq!(value, 2.0 * i as f32, "sample {} got someone else's reply", i);
        }

        batcher.shutdown();
        service.join();
    }

    #[test]
    fn partial_batch_is_dispatched_after_the_timeout() {
        // min_batch of 4 but only one producer, the timeout must flush it
        let batcher = Batcher::new(extractor(), options(4, 4, 50_000));
        let service = batcher.spawn_service(Doubler);
        let mut answer = Answer::default();

        assert_eq!(batcher.send_wait(&Ask { value: 1.0 }, &mut answer), ReplyStatus::Success);
        assert_eq!(answer.value, 2.0);

        batcher.shutdown();
        service.join();
    }

    #[test]
    fn failed_evaluator_fails_the_slot() {
        let batcher = Batcher::new(extractor(), options(1, 4, 1_000_000));
        let service = batcher.spawn_service(AlwaysFails);
        let mut answer = Answer::default();

        assert_eq!(batcher.send_wait(&Ask { value: 1.0 }, &mut answer), ReplyStatus::Failed);

        batcher.shutdown();
        service.join();
    }

    #[test]
    fn send_batch_spans_physical_batches() {
        // max_batch 2 but 5 samples in one logical request
        let batcher = Batcher::new(extractor(), options(1, 2, 1_000_000));
        let service = batcher.spawn_service(Doubler);
        let asks = (0..5).map(|i| Ask { value: i as f32 }).collect::<Vec<_>>();
        let ask_refs = asks.iter().collect::<Vec<_>>();
        let mut answers = vec! [Answer::default(); 5];

        let status = batcher.send_batch_wait(&ask_refs, &mut answers);

        assert_eq!(status, ReplyStatus::Success);
        for (i, answer) in answers.iter().enumerate() {
            assert_eq!(answer.value, 2.0 * i as f32);
        }

        batcher.shutdown();
        service.join();
    }

    #[test]
    fn sub_batch_callbacks_fire_in_order() {
        let batcher = Batcher::new(extractor(), options(1, 8, 1_000_000));
        let service = batcher.spawn_service(Doubler);
        let asks = (0..7).map(|i| Ask { value: i as f32 }).collect::<Vec<_>>();
        let ask_refs = asks.iter().collect::<Vec<_>>();
        let mut answers = vec! [Answer::default(); 7];
        let mut ranges = vec! [];

        let status = batcher.send_batches_wait(&ask_refs, &mut answers, 3, |range, status| {
            assert_eq!(status, ReplyStatus::Success);
            ranges.push(range);
        });

        assert_eq!(status, ReplyStatus::Success);
        assert_eq!(ranges, vec! [0..3, 3..6, 6..7]);

        batcher.shutdown();
        service.join();
    }

    #[test]
    fn shutdown_fails_pending_requests() {
        let batcher = Batcher::new(extractor(), options(8, 8, 30_000_000));
        let other = batcher.clone();
        let producer = thread::spawn(move || {
            let mut answer = Answer::default();

            other.send_wait(&Ask { value: 1.0 }, &mut answer)
        });

        // give the producer time to claim its slot, then pull the plug
        thread::sleep(Duration::from_millis(50));
        batcher.shutdown();

        assert_eq!(producer.join().unwrap(), ReplyStatus::Failed);
        assert!(batcher.wait_batch().is_none());
    }

    #[test]
    fn random_evaluator_stamps_the_version() {
        let batcher = Batcher::new(extractor(), options(1, 4, 1_000_000));
        let service = batcher.spawn_service(RandomEvaluator { version: 17 });
        let mut answer = Answer::default();

        assert_eq!(batcher.send_wait(&Ask { value: 0.0 }, &mut answer), ReplyStatus::Success);
        assert_eq!(answer.version, 17);
        assert!(answer.value >= 0.0 && answer.value < 1.0);

        batcher.shutdown();
        service.join();
    }

    #[test]
    fn status_combination_prefers_failure() {
        assert_eq!(ReplyStatus::Success.and(ReplyStatus::Failed), ReplyStatus::Failed);
        assert_eq!(ReplyStatus::Unknown.and(ReplyStatus::Success), ReplyStatus::Unknown);
        assert_eq!(ReplyStatus::Success.and(ReplyStatus::Success), ReplyStatus::Success);
    }
}
