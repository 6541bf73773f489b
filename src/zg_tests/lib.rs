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

//! End-to-end tests wiring the whole platform together: server, client,
//! dispatcher, batched evaluator, and the wire in between.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use zg_batch::{BatchOptions, Batcher, Evaluator, ReplyStatus, Slab};
    use zg_mcts::options::{PickMethod, SearchOptions};
    use zg_train::actor::{make_extractor, EvalBatcher};
    use zg_train::client::Client;
    use zg_train::options::GameOptions;
    use zg_train::record::{ModelPair, Request};
    use zg_train::server::TrainCtrl;
    use zg_train::transport::ServerTransport;

    fn tiny_mcts_options() -> SearchOptions {
        SearchOptions {
            num_threads: 1,
            num_rollouts_per_thread: 2,
            num_rollouts_per_batch: 2,
            virtual_loss: 1.0,
            root_epsilon: 0.25,
            root_alpha: 0.03,
            persistent_tree: true,
            pick_method: PickMethod::MostVisited,
            seed: 11,
            alg: Default::default()
        }
    }

    fn tiny_game_options() -> GameOptions {
        GameOptions {
            selfplay_init_num: 1,
            selfplay_update_num: 1,
            eval_num_games: 0,
            q_min_size: 1,
            num_reader: 4,
            never_resign_prob: 1.0,
            ..GameOptions::for_tests()
        }
    }

    fn eval_batcher() -> EvalBatcher {
        Batcher::new(make_extractor(), BatchOptions {
            label: "e2e".to_string(),
            min_batch: 1,
            max_batch: 8,
            timeout_us: 2_000_000
        })
    }

    /// Uniform random policy whose version stamp can be flipped while the
    /// pipeline is running.
    struct SwitchableEvaluator {
        version: Arc<AtomicI64>
    }

    impl Evaluator for SwitchableEvaluator {
        fn forward(&mut self, input: &Slab, output: &mut Slab) -> ReplyStatus {
            let version = self.version.load(Ordering::Acquire);

            for row in 0..input.effective_batch_size() {
                for value in output.field_mut(0, row).as_f32() {
                    *value = 0.5;
                }
                output.field_mut(1, row).as_f32()[0] = 0.0;
                output.field_mut(2, row).as_i64()[0] = version;
            }
            ReplyStatus::Success
        }
    }

    fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut ready: F) -> bool {
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            if ready() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn selfplay_games_flow_from_client_to_server() {
        let options = tiny_game_options();
        let train_ctrl = TrainCtrl::new(
            options.clone(),
            tiny_mcts_options(),
            Box::new(zg_utils::sec_since_epoch)
        );

        train_ctrl.set_initial_version(0);

        let server = ServerTransport::bind("127.0.0.1:0", train_ctrl.clone()).unwrap();
        let batcher = eval_batcher();
        let service = batcher.spawn_service(SwitchableEvaluator {
            version: Arc::new(AtomicI64::new(0))
        });
        let client = Client::new(
            "e2e-worker",
            server.local_addr(),
            options,
            batcher.clone(),
            1
        );

        let arrived = wait_until(Duration::from_secs(120), || {
            train_ctrl.selfplay().num_selfplay_curr_model() > 0
        });

        assert!(arrived, "no self-play game reached the server");
        assert!(train_ctrl.replay_buffer().len() > 0);
        assert_eq!(train_ctrl.client_manager().num_clients(), 1);

        client.stop();
        drop(server);
        batcher.shutdown();
        service.join();
    }

    #[test]
    fn async_games_remember_every_contributing_model() {
        // no server here: requests are injected locally and the records
        // stay in the client's outbox (the writer cannot connect)
        let options = tiny_game_options();
        let batcher = eval_batcher();
        let version = Arc::new(AtomicI64::new(1));
        let service = batcher.spawn_service(SwitchableEvaluator {
            version: version.clone()
        });
        let client = Client::new(
            "async-worker",
            "127.0.0.1:9",
            options,
            batcher.clone(),
            1
        );

        let mut request = Request {
            vers: ModelPair {
                black_ver: 1,
                white_ver: -1,
                mcts_opt: tiny_mcts_options()
            },
            ..Default::default()
        };

        request.async_mode = true;
        client.set_request(request.clone());

        // wait out the first complete game, then switch the model under
        // the running session
        let first_done = wait_until(Duration::from_secs(120), || client.records().len() > 0);

        assert!(first_done, "no game finished under the first model");
        client.records().dump_and_clear();

        version.store(2, Ordering::Release);
        request.vers.black_ver = 2;
        client.set_request(request);

        // the game spanning the switch saw replies from both models
        let mixed = wait_until(Duration::from_secs(120), || {
            client.records().dump_and_clear().records.iter().any(|record| {
                record.result.using_models.contains(&1)
                    && record.result.using_models.contains(&2)
            })
        });

        assert!(mixed, "no record captured both model versions");

        client.stop();
        batcher.shutdown();
        service.join();
    }
}
