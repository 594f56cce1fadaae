//! Submission sessions against the central server.
//!
//! # Purpose
//! Performs exactly one request/reply exchange per call: dial, write the
//! request frames, read the single reply, close.
//!
//! # Design notes
//! Connections are never pooled or reused. The protocol is strictly
//! half-duplex and the client has nothing else to send while it waits for an
//! acknowledgement. Every exchange races the cancellation token; when the token
//! fires first the exchange future is dropped, which closes the socket and
//! unblocks any pending read or write immediately.
//!
//! No retries happen here. Retry policy belongs to the loop controller.
use bytes::Bytes;
use lotto_wire::{Bet, Reply, ReplyKind, Request};
use std::collections::BTreeSet;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::packer::Batch;
use crate::wire::{read_reply, write_frame};

#[derive(Debug, Clone)]
pub struct Session {
    server_address: String,
    max_frame_bytes: usize,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        server_address: impl Into<String>,
        max_frame_bytes: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            server_address: server_address.into(),
            max_frame_bytes,
            cancel,
        }
    }

    pub fn server_address(&self) -> &str {
        &self.server_address
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Sends a single `BET` and waits for its `ACK`.
    pub async fn send_bet(&self, bet: &Bet) -> Result<()> {
        let request = Request::Bet(bet.clone());
        let frames = [request.encode()?];
        match self.exchange(&frames, request.reply_kind()).await? {
            Reply::Ack => Ok(()),
            Reply::AckError { reason } => Err(Error::ServerRejected { reason }),
            other => Err(unexpected(other)),
        }
    }

    /// Sends the batch header frame followed by one frame per bet line and
    /// returns the count the server acknowledged.
    pub async fn submit_batch(&self, batch: &Batch) -> Result<usize> {
        let header = Request::Batch {
            agency: batch.agency().to_string(),
            count: batch.len(),
        };
        let mut frames = Vec::with_capacity(batch.len() + 1);
        frames.push(header.encode()?);
        frames.extend(
            batch
                .bets()
                .iter()
                .map(|bet| Bytes::from(bet.encode_line())),
        );
        match self.exchange(&frames, header.reply_kind()).await? {
            Reply::AckBatch { count } if count == batch.len() => Ok(count),
            Reply::AckBatch { count } => Err(Error::Protocol(format!(
                "server acknowledged {count} bets for a batch of {}",
                batch.len()
            ))),
            Reply::AckBatchError { reason } => Err(Error::ServerRejected { reason }),
            other => Err(unexpected(other)),
        }
    }

    /// Tells the server this agency has submitted its full dataset.
    pub async fn submit_done(&self, agency: &str) -> Result<()> {
        let request = Request::Done {
            agency: agency.to_string(),
        };
        let frames = [request.encode()?];
        match self.exchange(&frames, request.reply_kind()).await? {
            Reply::AckDone => Ok(()),
            Reply::AckDoneError { reason } => Err(Error::ServerRejected {
                reason: if reason.is_empty() {
                    "done rejected".to_string()
                } else {
                    reason
                },
            }),
            other => Err(unexpected(other)),
        }
    }

    /// Asks for the agency's winners. `WINNERS|ERR|…` (typically `not_ready`)
    /// surfaces as `ServerRejected`.
    pub async fn request_winners(&self, agency: &str) -> Result<BTreeSet<String>> {
        let request = Request::GetWinners {
            agency: agency.to_string(),
        };
        let frames = [request.encode()?];
        match self.exchange(&frames, request.reply_kind()).await? {
            Reply::Winners { documents } => Ok(documents.into_iter().collect()),
            Reply::WinnersError { reason } => Err(Error::ServerRejected { reason }),
            other => Err(unexpected(other)),
        }
    }

    async fn exchange(&self, frames: &[Bytes], expected: ReplyKind) -> Result<Reply> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                // Dropping the losing branch closes the in-flight connection.
                debug!(server = %self.server_address, %expected, "exchange cancelled");
                Err(Error::Cancelled)
            }
            result = self.round_trip(frames, expected) => result,
        }
    }

    async fn round_trip(&self, frames: &[Bytes], expected: ReplyKind) -> Result<Reply> {
        let mut stream = TcpStream::connect(self.server_address.as_str())
            .await
            .map_err(Error::connection("connect"))?;
        debug!(server = %self.server_address, frames = frames.len(), "connected");
        let _ = stream.set_nodelay(true);
        let result = send_and_receive(&mut stream, frames, expected, self.max_frame_bytes).await;
        let _ = stream.shutdown().await;
        result
    }
}

async fn send_and_receive(
    stream: &mut TcpStream,
    frames: &[Bytes],
    expected: ReplyKind,
    max_frame_bytes: usize,
) -> Result<Reply> {
    for payload in frames {
        write_frame(stream, payload, max_frame_bytes).await?;
    }
    stream.flush().await.map_err(Error::connection("flush"))?;
    read_reply(stream, expected, max_frame_bytes).await
}

fn unexpected(reply: Reply) -> Error {
    Error::Protocol(format!("unexpected reply {reply:?}"))
}
