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

extern crate env_logger;
#[macro_use] extern crate log;
extern crate zg_batch;
extern crate zg_mcts;
extern crate zg_train;
extern crate zg_utils;

use std::env;
use std::process;
use std::thread;
use std::time::Duration;

use zg_batch::{BatchOptions, Batcher, RandomEvaluator};
use zg_mcts::options::SearchOptions;
use zg_train::actor::make_extractor;
use zg_train::client::Client;
use zg_train::options::GameOptions;
use zg_train::server::TrainCtrl;
use zg_train::transport::ServerTransport;
use zg_utils::config;

/// Run the training server: accept client connections, schedule self-play
/// and evaluation games, gate model promotions.
fn run_server() {
    let options = GameOptions::default();
    let train_ctrl = TrainCtrl::new(
        options,
        SearchOptions::default(),
        Box::new(zg_utils::sec_since_epoch)
    );

    train_ctrl.set_initial_version(0);

    let server = match ServerTransport::bind(&config::SERVER_ADDR, train_ctrl.clone()) {
        Ok(server) => server,
        Err(reason) => {
            error!("could not bind {}: {}", *config::SERVER_ADDR, reason);
            process::exit(1);
        }
    };

    info!("server ready on {}", server.local_addr());

    loop {
        thread::sleep(Duration::from_secs(60));
        info!(
            "replay buffer: {} records, {} clients, selfplay model {}",
            train_ctrl.replay_buffer().len(),
            train_ctrl.client_manager().num_clients(),
            train_ctrl.selfplay().curr_model()
        );
    }
}

/// Run a self-play worker: game threads search with a batched evaluator
/// and ship finished games to the server.
fn run_selfplay() {
    let options = GameOptions::default();
    let batcher = Batcher::new(make_extractor(), BatchOptions::default());

    // without a trained network attached this worker evaluates with the
    // built-in random evaluator, which is enough to exercise the full
    // pipeline end to end
    let _service = batcher.spawn_service(RandomEvaluator { version: 0 });
    let identity = format!("worker-{}", process::id());

    info!("starting {} with {} games", identity, *config::NUM_GAMES);

    let client = Client::new(
        &identity,
        &config::SERVER_ADDR,
        options,
        batcher.clone(),
        *config::NUM_GAMES
    );

    loop {
        thread::sleep(Duration::from_secs(60));
        info!("{} records pending", client.records().len());
    }
}

fn main() {
    env_logger::init();

    let args = env::args().collect::<Vec<_>>();
    let mode = args.get(1).map(String::as_str).unwrap_or("");

    match mode {
        "server" => run_server(),
        "selfplay" => run_selfplay(),
        _ => {
            eprintln!("usage: {} (server | selfplay)", args[0]);
            eprintln!();
            eprintln!("configuration is taken from the environment, e.g.");
            eprintln!("  SERVER_ADDR=127.0.0.1:1234 NUM_GAMES=16 {} selfplay", args[0]);
            process::exit(64);
        }
    }
}
