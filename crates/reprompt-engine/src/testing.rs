//! Fakes shared by the unit tests.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{mpsc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::ServiceError;
use crate::lm::{ChatRequest, LanguageModel};

/// Replies in order and records every request.
pub(crate) struct ScriptedLm {
    replies: Mutex<Vec<String>>,
    pub(crate) seen: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLm {
    pub(crate) fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().rev().map(|reply| reply.to_string()).collect()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }
}

impl LanguageModel for ScriptedLm {
    fn complete(&self, request: &ChatRequest) -> Result<String, ServiceError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(request.clone());
        }
        self.replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.pop())
            .ok_or_else(|| ServiceError::malformed("scripted", "no reply left"))
    }
}

/// Answers every request with the same text.
pub(crate) struct FixedLm(pub(crate) String);

impl LanguageModel for FixedLm {
    fn complete(&self, _request: &ChatRequest) -> Result<String, ServiceError> {
        Ok(self.0.clone())
    }
}

enum StubReply {
    Respond { status: u16, body: String },
    Hang(Duration),
}

/// One-connection-per-request HTTP/1.1 server on loopback.
///
/// Replies are queued with `respond`/`hang` and consumed in request order;
/// `finish` returns the raw requests it saw.
pub(crate) struct StubServer {
    addr: SocketAddr,
    replies: mpsc::Sender<StubReply>,
    worker: thread::JoinHandle<std::io::Result<Vec<String>>>,
}

impl StubServer {
    pub(crate) fn start(connections: usize) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let (replies, queued) = mpsc::channel::<StubReply>();
        let worker = thread::spawn(move || {
            let mut requests = Vec::new();
            for _ in 0..connections {
                let (mut stream, _) = listener.accept()?;
                requests.push(read_request(&mut stream)?);
                match queued.recv() {
                    Ok(StubReply::Respond { status, body }) => {
                        let head = format!(
                            "HTTP/1.1 {status} STUB\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            body.len()
                        );
                        stream.write_all(head.as_bytes())?;
                        stream.write_all(body.as_bytes())?;
                    }
                    Ok(StubReply::Hang(hold)) => thread::sleep(hold),
                    Err(_) => break,
                }
            }
            Ok(requests)
        });
        Ok(Self {
            addr,
            replies,
            worker,
        })
    }

    pub(crate) fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub(crate) fn respond(&self, status: u16, body: &str) {
        let _ = self.replies.send(StubReply::Respond {
            status,
            body: body.to_string(),
        });
    }

    /// Reads the request, then keeps the socket open without answering.
    pub(crate) fn hang(&self, hold: Duration) {
        let _ = self.replies.send(StubReply::Hang(hold));
    }

    pub(crate) fn finish(self) -> anyhow::Result<Vec<String>> {
        drop(self.replies);
        let requests = self
            .worker
            .join()
            .map_err(|_| anyhow::anyhow!("stub server panicked"))??;
        Ok(requests)
    }
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);
        let Some(head_end) = raw.windows(4).position(|window| window == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&raw[..head_end]).to_ascii_lowercase();
        let body_len = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if raw.len() >= head_end + 4 + body_len {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&raw).into_owned())
}
