// Scripted central server used by session and controller tests.
use lotto_wire::{Bet, DEFAULT_MAX_FRAME_BYTES, Request};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::wire::{read_frame, write_frame};

pub(crate) enum Step {
    // Read the request, then answer with this payload.
    Reply(&'static str),
    // Read the request and never answer; wait for the client to close.
    Hang,
    // Read the request, then close without answering.
    Close,
}

pub(crate) struct ScriptedServer {
    addr: String,
    connections: Arc<Mutex<Vec<Vec<String>>>>,
    peer_closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ScriptedServer {
    pub(crate) async fn start(steps: Vec<Step>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr").to_string();
        let connections = Arc::new(Mutex::new(Vec::new()));
        let peer_closed = Arc::new(AtomicBool::new(false));
        let task = {
            let connections = Arc::clone(&connections);
            let peer_closed = Arc::clone(&peer_closed);
            tokio::spawn(async move {
                for step in steps {
                    let Ok((mut stream, _)) = listener.accept().await else {
                        return;
                    };
                    let frames = read_request(&mut stream).await;
                    connections.lock().expect("lock").push(frames);
                    match step {
                        Step::Reply(payload) => {
                            let _ = write_frame(
                                &mut stream,
                                payload.as_bytes(),
                                DEFAULT_MAX_FRAME_BYTES,
                            )
                            .await;
                            let _ = stream.shutdown().await;
                        }
                        Step::Hang => {
                            while read_frame(&mut stream, DEFAULT_MAX_FRAME_BYTES).await.is_ok() {}
                            peer_closed.store(true, Ordering::SeqCst);
                        }
                        Step::Close => drop(stream),
                    }
                }
            })
        };
        Self {
            addr,
            connections,
            peer_closed,
            task,
        }
    }

    pub(crate) fn addr(&self) -> String {
        self.addr.clone()
    }

    /// Request payloads received so far, one entry per connection.
    pub(crate) fn connections(&self) -> Vec<Vec<String>> {
        self.connections.lock().expect("lock").clone()
    }

    pub(crate) async fn wait_for_connections(&self, count: usize) {
        wait_until(|| self.connections().len() >= count).await;
    }

    pub(crate) async fn wait_for_peer_close(&self) {
        wait_until(|| self.peer_closed.load(Ordering::SeqCst)).await;
    }
}

impl Drop for ScriptedServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_request(stream: &mut TcpStream) -> Vec<String> {
    let mut frames = Vec::new();
    let Ok(first) = read_frame(stream, DEFAULT_MAX_FRAME_BYTES).await else {
        return frames;
    };
    let lines = match Request::decode(&first) {
        Ok(Request::Batch { count, .. }) => count,
        _ => 0,
    };
    frames.push(String::from_utf8_lossy(&first).into_owned());
    for _ in 0..lines {
        match read_frame(stream, DEFAULT_MAX_FRAME_BYTES).await {
            Ok(line) => frames.push(String::from_utf8_lossy(&line).into_owned()),
            Err(_) => break,
        }
    }
    frames
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// An address nothing is listening on.
pub(crate) async fn unused_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("local addr").to_string()
}

pub(crate) fn sample_bets(agency: &str, count: usize) -> Vec<Bet> {
    (0..count)
        .map(|i| Bet {
            agency: agency.to_string(),
            first_name: "Maria".to_string(),
            last_name: "Gomez".to_string(),
            document: (30_000_000 + i).to_string(),
            birthdate: "1990-05-17".to_string(),
            number: 10_000 + i as i64,
        })
        .collect()
}
