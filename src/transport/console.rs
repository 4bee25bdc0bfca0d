//! Console channel: events as JSON lines on stdout, replies as JSON lines
//! on stdin

use super::{NotificationChannel, ProcessEvent};
use crate::gate::OperatorReply;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::warn;

pub struct ConsoleChannel {
    channel_id: String,
    stdin: Mutex<Lines<BufReader<Stdin>>>,
    stdout: Mutex<tokio::io::Stdout>,
    open: AtomicBool,
}

impl Default for ConsoleChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleChannel {
    pub fn new() -> Self {
        Self {
            channel_id: format!("console-{}", std::process::id()),
            stdin: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
            stdout: Mutex::new(tokio::io::stdout()),
            open: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl NotificationChannel for ConsoleChannel {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    async fn send(&self, process_id: &str, event: &ProcessEvent) {
        if !self.is_open() {
            return;
        }
        let line = json!({ "process_id": process_id, "payload": event }).to_string();
        let mut stdout = self.stdout.lock().await;
        let written = async {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(error = %e, "Failed to write event to stdout");
        }
    }

    async fn receive(&self, _process_id: &str) -> Option<OperatorReply> {
        let mut lines = self.stdin.lock().await;
        loop {
            if !self.is_open() {
                return None;
            }
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<OperatorReply>(&line) {
                    Ok(reply) => return Some(reply),
                    Err(e) => warn!(error = %e, "Ignoring unparseable reply line"),
                },
                Ok(None) => {
                    self.open.store(false, Ordering::SeqCst);
                    return None;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    self.open.store(false, Ordering::SeqCst);
                    return None;
                }
            }
        }
    }

    async fn keepalive(&self) -> bool {
        self.is_open()
    }

    async fn close(&self, _reason: &str) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
