//! Cart commands and the outbound write queue
//!
//! Manual commands and GPS telemetry share one characteristic. Every write
//! goes through a single queue drained by one task, so writes leave in call
//! order and never overlap.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::codec;
use crate::core::bluetooth::error::LinkError;
use crate::core::bluetooth::transport::Transport;
use crate::core::bluetooth::types::{GpsSample, LinkHandle};

/// Cart commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CartCommand {
    Up,
    Down,
    Left,
    Right,
    Stop,
    Start,
}

impl CartCommand {
    pub const ALL: [CartCommand; 6] = [
        Self::Up,
        Self::Down,
        Self::Left,
        Self::Right,
        Self::Stop,
        Self::Start,
    ];

    /// The ASCII token sent on the wire
    pub fn token(&self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::Left => "LEFT",
            Self::Right => "RIGHT",
            Self::Stop => "STOP",
            Self::Start => "START",
        }
    }

    /// Convert the command to its framed representation
    pub fn to_bytes(&self) -> Vec<u8> {
        codec::encode_command(self.token())
    }
}

impl fmt::Display for CartCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for CartCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.token().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown cart command: {}", s))
    }
}

struct WriteRequest {
    frame: Vec<u8>,
    label: String,
    ack: oneshot::Sender<Result<(), LinkError>>,
}

/// Clonable handle onto the write queue of one connection
#[derive(Clone)]
pub struct CommandChannel {
    tx: mpsc::Sender<WriteRequest>,
}

impl CommandChannel {
    /// Starts the writer task for `handle`. It stops when `cancel` fires or
    /// every channel clone is dropped.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        handle: &LinkHandle,
        write_timeout: Duration,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writer = Writer {
            transport,
            peripheral_id: handle.peripheral.id.clone(),
            service: handle.service,
            characteristic: handle.outbound,
            write_timeout,
        };
        let task = tokio::spawn(writer.drain(rx, cancel));
        (Self { tx }, task)
    }

    /// Sends a command token, waiting for the cart to acknowledge it
    pub async fn send_command(&self, token: &str) -> Result<(), LinkError> {
        self.submit(codec::encode_command(token), token.to_string())
            .await
    }

    /// Sends a position fix
    pub async fn send_telemetry(&self, sample: GpsSample) -> Result<(), LinkError> {
        let text = codec::telemetry_text(sample.latitude, sample.longitude);
        self.submit(codec::frame(text.as_bytes()), format!("telemetry {}", text))
            .await
    }

    async fn submit(&self, frame: Vec<u8>, label: String) -> Result<(), LinkError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WriteRequest { frame, label, ack })
            .await
            .map_err(|_| LinkError::NotConnected)?;
        done.await.map_err(|_| LinkError::NotConnected)?
    }
}

struct Writer {
    transport: Arc<dyn Transport>,
    peripheral_id: String,
    service: uuid::Uuid,
    characteristic: uuid::Uuid,
    write_timeout: Duration,
}

impl Writer {
    async fn drain(self, mut rx: mpsc::Receiver<WriteRequest>, cancel: CancellationToken) {
        loop {
            let request = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            // An in-flight write runs to completion even if the link is torn down meanwhile
            let result = self.write(&request).await;
            match &result {
                Ok(()) => debug!("Sent {} to {}", request.label, self.peripheral_id),
                Err(e) => warn!("Failed to send {}: {}", request.label, e),
            }
            let _ = request.ack.send(result);
        }

        // Queued writes belong to a session that is gone; fail them instead of sending
        rx.close();
        while let Some(request) = rx.recv().await {
            let _ = request.ack.send(Err(LinkError::NotConnected));
        }
        info!("Command writer for {} stopped", self.peripheral_id);
    }

    async fn write(&self, request: &WriteRequest) -> Result<(), LinkError> {
        let write = self.transport.write(
            &self.peripheral_id,
            self.service,
            self.characteristic,
            &request.frame,
        );
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LinkError::WriteError(e.to_string())),
            Err(_) => Err(LinkError::WriteError(format!(
                "{} not acknowledged within {} ms",
                request.label,
                self.write_timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens() {
        let tokens: Vec<&str> = CartCommand::ALL.iter().map(|c| c.token()).collect();
        assert_eq!(tokens, ["UP", "DOWN", "LEFT", "RIGHT", "STOP", "START"]);
        assert_eq!(CartCommand::Stop.to_bytes(), codec::encode_command("STOP"));
    }

    #[test]
    fn test_parse_ignores_case() {
        assert_eq!("stop".parse::<CartCommand>(), Ok(CartCommand::Stop));
        assert_eq!("Left".parse::<CartCommand>(), Ok(CartCommand::Left));
        assert!("jump".parse::<CartCommand>().is_err());
    }
}
