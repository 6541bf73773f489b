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

//! The server ↔ client wire: length-prefixed JSON frames over TCP. Every
//! exchange is one round-trip, the client ships a `Records` payload (its
//! identity travels inside) and the server answers with a `RequestSeq`.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::record::{Records, RequestSeq};
use crate::server::TrainCtrl;

/// The largest frame either side will accept.
const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// Write one `u32`-length-prefixed frame.
///
/// # Arguments
///
/// * `stream` -
/// * `body` -
///
pub fn write_frame<W: Write>(stream: &mut W, body: &[u8]) -> io::Result<()> {
    let len = body.len() as u32;

    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

/// Read one `u32`-length-prefixed frame.
///
/// # Arguments
///
/// * `stream` -
///
pub fn read_frame<R: Read>(stream: &mut R) -> io::Result<Vec<u8>> {
    let mut len = [0u8; 4];

    stream.read_exact(&mut len)?;

    let len = u32::from_le_bytes(len);

    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }

    let mut body = vec! [0u8; len as usize];

    stream.read_exact(&mut body)?;
    Ok(body)
}

/// The accept loop plus its per-connection threads.
pub struct ServerTransport {
    done: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    local_addr: String
}

impl ServerTransport {
    /// Bind `addr` and serve `train_ctrl` until `stop` is called.
    ///
    /// # Arguments
    ///
    /// * `addr` -
    /// * `train_ctrl` -
    ///
    pub fn bind(addr: &str, train_ctrl: Arc<TrainCtrl>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?.to_string();
        let done = Arc::new(AtomicBool::new(false));

        listener.set_nonblocking(true)?;

        let accept_done = done.clone();
        let accept_thread = thread::Builder::new()
            .name("server_accept".into())
            .spawn(move || accept_loop(listener, train_ctrl, accept_done))
            .expect("could not spawn accept thread");

        info!("serving on {}", local_addr);
        Ok(Self {
            done: done,
            accept_thread: Some(accept_thread),
            local_addr: local_addr
        })
    }

    /// The address the listener actually bound, useful with port zero.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn stop(&mut self) {
        self.done.store(true, Ordering::Release);

        if let Some(handle) = self.accept_thread.take() {
            handle.join().expect("could not join accept thread");
        }
    }
}

impl Drop for ServerTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, train_ctrl: Arc<TrainCtrl>, done: Arc<AtomicBool>) {
    let mut connections: Vec<JoinHandle<()>> = vec! [];

    while !done.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("connection from {}", peer);

                let train_ctrl = train_ctrl.clone();
                let done = done.clone();
                let handle = thread::Builder::new()
                    .name(format!("server_conn_{}", peer))
                    .spawn(move || serve_connection(stream, train_ctrl, done))
                    .expect("could not spawn connection thread");

                connections.push(handle);
            },
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(20));
            },
            Err(e) => {
                warn!("accept failed: {}", e);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }

    for handle in connections {
        handle.join().ok();
    }
}

/// One request-reply exchange per inbound frame until the peer hangs up
/// or we shut down.
fn serve_connection(mut stream: TcpStream, train_ctrl: Arc<TrainCtrl>, done: Arc<AtomicBool>) {
    stream.set_nonblocking(false).ok();
    stream.set_read_timeout(Some(Duration::from_millis(250))).ok();

    while !done.load(Ordering::Acquire) {
        let body = match read_frame(&mut stream) {
            Ok(body) => body,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock
                || e.kind() == io::ErrorKind::TimedOut => continue,
            Err(_) => break
        };

        let records: Records = match serde_json::from_slice(&body) {
            Ok(records) => records,
            Err(e) => {
                warn!("malformed payload: {}", e);
                continue;
            }
        };

        let identity = records.identity.clone();

        train_ctrl.on_receive(&records);

        let reply = train_ctrl.on_reply(&identity);
        let reply = match serde_json::to_vec(&reply) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("could not serialize reply: {}", e);
                continue;
            }
        };

        if write_frame(&mut stream, &reply).is_err() {
            break;
        }
    }
}

/// The client side of the wire, reconnecting as needed.
pub struct ClientChannel {
    addr: String,
    stream: Option<TcpStream>
}

impl ClientChannel {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            stream: None
        }
    }

    /// One poll: ship `records`, take the next work order back.
    ///
    /// # Arguments
    ///
    /// * `records` -
    ///
    pub fn exchange(&mut self, records: &Records) -> io::Result<RequestSeq> {
        let result = self.try_exchange(records);

        if result.is_err() {
            // next call starts from a fresh connection
            self.stream = None;
        }
        result
    }

    fn try_exchange(&mut self, records: &Records) -> io::Result<RequestSeq> {
        if self.stream.is_none() {
            let stream = TcpStream::connect(&self.addr)?;

            stream.set_read_timeout(Some(Duration::from_secs(60))).ok();
            stream.set_nodelay(true).ok();
            self.stream = Some(stream);
        }

        let stream = self.stream.as_mut().expect("stream was just connected");
        let body = serde_json::to_vec(records)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        write_frame(stream, &body)?;

        let reply = read_frame(stream)?;

        serde_json::from_slice(&reply)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_manager::tests::manual_timer;
    use crate::options::GameOptions;
    use std::io::Cursor;
    use zg_mcts::options::SearchOptions;

    #[test]
    fn frame_round_trip() {
        let mut buffer = vec! [];

        write_frame(&mut buffer, b"hello").unwrap();

        let mut cursor = Cursor::new(buffer);

        assert_eq!(read_frame(&mut cursor).unwrap(), b"hello");
    }

    #[test]
    fn oversized_frames_are_rejected()  {
        let mut buffer = vec! [];

        buffer.extend_from_slice(&u32::MAX.to_le_bytes());
        buffer.extend_from_slice(b"junk");

        let mut cursor = Cursor::new(buffer);

        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn poll_over_localhost() {
        let (_, timer) = manual_timer();
        let ctrl = TrainCtrl::new(
            GameOptions::for_tests(),
            SearchOptions::default(),
            timer
        );

        ctrl.set_initial_version(4);

        let mut server = ServerTransport::bind("127.0.0.1:0", ctrl.clone()).unwrap();
        let mut channel = ClientChannel::new(server.local_addr());

        let first = channel.exchange(&Records::new("worker-1")).unwrap();
        let second = channel.exchange(&Records::new("worker-1")).unwrap();

        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert_eq!(first.request.vers.black_ver, 4);

        server.stop();
    }
}
