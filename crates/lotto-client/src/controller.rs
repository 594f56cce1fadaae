//! Client loop controller.
//!
//! # Purpose
//! Drives one agency end to end: submit every batch, report completion, then
//! poll for winners until the server has heard from every agency.
//!
//! # Design notes
//! The loop is strictly sequential: one connection and one batch in flight at
//! a time. The only concurrency is the cancellation token, which is checked
//! between units of work and raced against every wait and every exchange.
//! Cancellation ends the loop with `LoopOutcome::Cancelled`, never an error.
//!
//! Failures while submitting or completing are fatal. While polling, transport
//! failures and "not ready" rejections are retried after a fixed backoff with
//! no attempt limit; protocol failures stay fatal.
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::packer::BatchPacker;
use crate::session::Session;
use crate::source::RecordSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Submitting,
    // Transient while a batch waits for its acknowledgement.
    AwaitingAck,
    Completing,
    PollingWinners,
    Done,
    Cancelled,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Done | LoopState::Cancelled)
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Submitting => "submitting",
            LoopState::AwaitingAck => "awaiting_ack",
            LoopState::Completing => "completing",
            LoopState::PollingWinners => "polling_winners",
            LoopState::Done => "done",
            LoopState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub batches: usize,
    pub bets: usize,
    pub poll_attempts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    Done {
        winners: BTreeSet<String>,
        summary: LoopSummary,
    },
    Cancelled {
        // State the loop was in when cancellation was observed.
        during: LoopState,
        summary: LoopSummary,
    },
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub agency: String,
    // Pause between acknowledged batches.
    pub loop_period: Duration,
    // Pause between winners polls.
    pub winners_backoff: Duration,
}

pub struct ClientLoop<S> {
    settings: LoopSettings,
    session: Session,
    packer: BatchPacker<S>,
    cancel: CancellationToken,
    state: LoopState,
    summary: LoopSummary,
    winners: BTreeSet<String>,
}

impl<S: RecordSource> ClientLoop<S> {
    pub fn new(settings: LoopSettings, session: Session, packer: BatchPacker<S>) -> Self {
        let cancel = session.cancel_token().clone();
        Self {
            settings,
            session,
            packer,
            cancel,
            state: LoopState::Submitting,
            summary: LoopSummary::default(),
            winners: BTreeSet::new(),
        }
    }

    pub fn from_config(config: &ClientConfig, source: S, cancel: CancellationToken) -> Self {
        let session = Session::new(
            config.server_address.clone(),
            config.max_frame_bytes,
            cancel,
        );
        let packer = BatchPacker::new(
            source,
            config.effective_batch_max_bytes(),
            config.batch_max_records,
        );
        let settings = LoopSettings {
            agency: config.agency_id.clone(),
            loop_period: config.loop_period,
            winners_backoff: config.winners_backoff,
        };
        Self::new(settings, session, packer)
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn summary(&self) -> &LoopSummary {
        &self.summary
    }

    pub async fn run(mut self) -> Result<LoopOutcome> {
        let mut cancelled_during = None;
        while !self.state.is_terminal() {
            let step = match self.state {
                LoopState::Submitting | LoopState::AwaitingAck => self.submit_next_batch().await,
                LoopState::Completing => self.complete().await,
                LoopState::PollingWinners => self.poll_winners().await,
                LoopState::Done | LoopState::Cancelled => break,
            };
            match step {
                Ok(next) => self.transition(next),
                Err(Error::Cancelled) => {
                    cancelled_during = Some(self.state);
                    self.transition(LoopState::Cancelled);
                }
                Err(err) => return Err(err),
            }
        }

        info!(
            agency = %self.settings.agency,
            batches = self.summary.batches,
            bets = self.summary.bets,
            state = %self.state,
            "action: loop_finished | result: success"
        );
        let summary = self.summary;
        Ok(match cancelled_during {
            Some(during) => LoopOutcome::Cancelled { during, summary },
            None => LoopOutcome::Done {
                winners: self.winners,
                summary,
            },
        })
    }

    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            debug!(agency = %self.settings.agency, from = %self.state, to = %next, "loop state");
            self.state = next;
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    async fn submit_next_batch(&mut self) -> Result<LoopState> {
        self.check_cancelled()?;
        let Some(batch) = self.packer.next_batch()? else {
            return Ok(LoopState::Completing);
        };
        self.transition(LoopState::AwaitingAck);
        let acked = self.session.submit_batch(&batch).await?;
        self.summary.batches += 1;
        self.summary.bets += acked;
        info!(
            agency = %self.settings.agency,
            batch = self.summary.batches,
            count = acked,
            bytes = batch.encoded_len(),
            "action: batch_sent | result: success"
        );
        self.transition(LoopState::Submitting);
        self.pause(self.settings.loop_period).await?;
        Ok(LoopState::Submitting)
    }

    async fn complete(&mut self) -> Result<LoopState> {
        self.check_cancelled()?;
        self.session.submit_done(&self.settings.agency).await?;
        info!(
            agency = %self.settings.agency,
            bets = self.summary.bets,
            "action: done_sent | result: success"
        );
        Ok(LoopState::PollingWinners)
    }

    async fn poll_winners(&mut self) -> Result<LoopState> {
        loop {
            self.check_cancelled()?;
            self.summary.poll_attempts += 1;
            match self.session.request_winners(&self.settings.agency).await {
                Ok(winners) => {
                    info!(
                        agency = %self.settings.agency,
                        cant_ganadores = winners.len(),
                        attempts = self.summary.poll_attempts,
                        "action: consulta_ganadores | result: success"
                    );
                    self.winners = winners;
                    return Ok(LoopState::Done);
                }
                Err(err) if err.is_retryable_poll() => {
                    debug!(
                        agency = %self.settings.agency,
                        attempt = self.summary.poll_attempts,
                        error = %err,
                        "winners not available yet"
                    );
                    self.pause(self.settings.winners_backoff).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Sleeps for `period` unless cancellation fires first. The losing timer
    /// is dropped with the select.
    async fn pause(&self, period: Duration) -> Result<()> {
        if period.is_zero() {
            return self.check_cancelled();
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(period) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::IterSource;
    use crate::test_support::{ScriptedServer, Step, sample_bets};
    use lotto_wire::{Bet, DEFAULT_MAX_FRAME_BYTES};
    use tokio::time::timeout;

    type TestLoop = ClientLoop<IterSource<std::vec::IntoIter<Bet>>>;

    fn client_loop(
        server: &ScriptedServer,
        bets: Vec<Bet>,
        max_records: usize,
        loop_period: Duration,
        cancel: CancellationToken,
    ) -> TestLoop {
        let session = Session::new(server.addr(), DEFAULT_MAX_FRAME_BYTES, cancel);
        let packer = BatchPacker::new(IterSource::new(bets), DEFAULT_MAX_FRAME_BYTES, max_records);
        let settings = LoopSettings {
            agency: "1".to_string(),
            loop_period,
            winners_backoff: Duration::from_millis(10),
        };
        ClientLoop::new(settings, session, packer)
    }

    #[tokio::test]
    async fn submits_two_maximal_batches_then_completes() {
        let server = ScriptedServer::start(vec![
            Step::Reply("ACK_BATCH|OK|204\n"),
            Step::Reply("ACK_BATCH|OK|46\n"),
            Step::Reply("ACK_DONE|OK\n"),
            Step::Reply("WINNERS|OK|30000007\n"),
        ])
        .await;
        let client = client_loop(
            &server,
            sample_bets("1", 250),
            1_000,
            Duration::ZERO,
            CancellationToken::new(),
        );

        let outcome = client.run().await.expect("run");
        let LoopOutcome::Done { winners, summary } = outcome else {
            panic!("expected done, got {outcome:?}");
        };
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.bets, 250);
        assert_eq!(winners.into_iter().collect::<Vec<_>>(), vec!["30000007"]);

        let connections = server.connections();
        assert_eq!(connections[0][0], "BATCH|1|204\n");
        assert_eq!(connections[0].len(), 205);
        assert_eq!(connections[1][0], "BATCH|1|46\n");
        assert_eq!(connections[2], vec!["DONE|1\n".to_string()]);
    }

    #[tokio::test]
    async fn polls_until_winners_are_ready() {
        let server = ScriptedServer::start(vec![
            Step::Reply("ACK_BATCH|OK|1\n"),
            Step::Reply("ACK_DONE|OK\n"),
            Step::Reply("WINNERS|ERR|not_ready\n"),
            Step::Reply("WINNERS|ERR|not_ready\n"),
            Step::Reply("WINNERS|ERR|not_ready\n"),
            Step::Reply("WINNERS|OK|123,456\n"),
        ])
        .await;
        let client = client_loop(
            &server,
            sample_bets("1", 1),
            100,
            Duration::ZERO,
            CancellationToken::new(),
        );

        let outcome = client.run().await.expect("run");
        let LoopOutcome::Done { winners, summary } = outcome else {
            panic!("expected done, got {outcome:?}");
        };
        assert_eq!(
            winners,
            BTreeSet::from(["123".to_string(), "456".to_string()])
        );
        // Three retries after the first attempt.
        assert_eq!(summary.poll_attempts, 4);
        let polls = server
            .connections()
            .iter()
            .filter(|frames| frames[0] == "GET_WINNERS|1\n")
            .count();
        assert_eq!(polls, 4);
    }

    #[tokio::test]
    async fn poll_connection_closed_without_reply_is_retried() {
        let server = ScriptedServer::start(vec![
            Step::Reply("ACK_BATCH|OK|1\n"),
            Step::Reply("ACK_DONE|OK\n"),
            Step::Close,
            Step::Reply("WINNERS|ERR|not_ready\n"),
            Step::Reply("WINNERS|OK|1\n"),
        ])
        .await;
        let client = client_loop(
            &server,
            sample_bets("1", 1),
            10,
            Duration::ZERO,
            CancellationToken::new(),
        );

        let outcome = client.run().await.expect("run");
        let LoopOutcome::Done { winners, summary } = outcome else {
            panic!("expected done, got {outcome:?}");
        };
        assert_eq!(winners, BTreeSet::from(["1".to_string()]));
        assert_eq!(summary.poll_attempts, 3);
        assert_eq!(server.connections().len(), 5);
    }

    #[tokio::test]
    async fn cancellation_during_pacing_stops_before_next_batch() {
        let server = ScriptedServer::start(vec![
            Step::Reply("ACK_BATCH|OK|1\n"),
            Step::Reply("ACK_BATCH|OK|1\n"),
            Step::Reply("ACK_BATCH|OK|1\n"),
            Step::Reply("ACK_DONE|OK\n"),
        ])
        .await;
        let cancel = CancellationToken::new();
        let client = client_loop(
            &server,
            sample_bets("1", 3),
            1,
            Duration::from_secs(30),
            cancel.clone(),
        );

        let running = tokio::spawn(client.run());
        server.wait_for_connections(1).await;
        // Let the acknowledgement land so the loop is inside the pacing wait.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let outcome = timeout(Duration::from_secs(2), running)
            .await
            .expect("loop stopped promptly")
            .expect("task")
            .expect("clean shutdown");
        assert!(matches!(
            outcome,
            LoopOutcome::Cancelled {
                during: LoopState::Submitting,
                summary: LoopSummary { batches: 1, .. }
            }
        ));
        let connections = server.connections();
        assert_eq!(connections.len(), 1);
        assert!(connections.iter().all(|frames| frames[0] != "DONE|1\n"));
    }

    #[tokio::test]
    async fn cancellation_during_stuck_exchange_is_clean() {
        let server = ScriptedServer::start(vec![Step::Hang]).await;
        let cancel = CancellationToken::new();
        let client = client_loop(
            &server,
            sample_bets("1", 5),
            100,
            Duration::ZERO,
            cancel.clone(),
        );

        let running = tokio::spawn(client.run());
        server.wait_for_connections(1).await;
        cancel.cancel();
        cancel.cancel();

        let outcome = timeout(Duration::from_secs(2), running)
            .await
            .expect("loop stopped promptly")
            .expect("task")
            .expect("clean shutdown");
        assert!(matches!(outcome, LoopOutcome::Cancelled { .. }));
        server.wait_for_peer_close().await;
    }

    #[tokio::test]
    async fn cancellation_during_polling_is_clean() {
        let server = ScriptedServer::start(vec![
            Step::Reply("ACK_BATCH|OK|1\n"),
            Step::Reply("ACK_DONE|OK\n"),
            Step::Reply("WINNERS|ERR|not_ready\n"),
        ])
        .await;
        let cancel = CancellationToken::new();
        let session = Session::new(server.addr(), DEFAULT_MAX_FRAME_BYTES, cancel.clone());
        let packer = BatchPacker::new(IterSource::new(sample_bets("1", 1)), 8192, 10);
        let settings = LoopSettings {
            agency: "1".to_string(),
            loop_period: Duration::ZERO,
            winners_backoff: Duration::from_secs(30),
        };
        let running = tokio::spawn(ClientLoop::new(settings, session, packer).run());
        server.wait_for_connections(3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let outcome = timeout(Duration::from_secs(2), running)
            .await
            .expect("loop stopped promptly")
            .expect("task")
            .expect("clean shutdown");
        assert!(matches!(
            outcome,
            LoopOutcome::Cancelled {
                during: LoopState::PollingWinners,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cancelled_before_start_sends_nothing() {
        let server = ScriptedServer::start(vec![Step::Reply("ACK_BATCH|OK|1\n")]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let client = client_loop(&server, sample_bets("1", 1), 10, Duration::ZERO, cancel);
        let outcome = client.run().await.expect("run");
        assert!(matches!(
            outcome,
            LoopOutcome::Cancelled {
                during: LoopState::Submitting,
                ..
            }
        ));
        assert!(server.connections().is_empty());
    }

    #[tokio::test]
    async fn rejected_batch_is_fatal_and_skips_done() {
        let server = ScriptedServer::start(vec![
            Step::Reply("ACK_BATCH|ERR|storage full\n"),
            Step::Reply("ACK_DONE|OK\n"),
        ])
        .await;
        let client = client_loop(
            &server,
            sample_bets("1", 3),
            1,
            Duration::ZERO,
            CancellationToken::new(),
        );
        let err = client.run().await.expect_err("fatal");
        assert!(matches!(err, Error::ServerRejected { .. }));
        assert_eq!(server.connections().len(), 1);
    }

    #[tokio::test]
    async fn rejected_done_is_fatal() {
        let server = ScriptedServer::start(vec![
            Step::Reply("ACK_BATCH|OK|1\n"),
            Step::Reply("ACK_DONE|ERR\n"),
        ])
        .await;
        let client = client_loop(
            &server,
            sample_bets("1", 1),
            10,
            Duration::ZERO,
            CancellationToken::new(),
        );
        let err = client.run().await.expect_err("fatal");
        assert!(matches!(err, Error::ServerRejected { .. }));
    }

    #[tokio::test]
    async fn protocol_error_while_polling_is_fatal() {
        let server = ScriptedServer::start(vec![
            Step::Reply("ACK_BATCH|OK|1\n"),
            Step::Reply("ACK_DONE|OK\n"),
            Step::Reply("ACK|OK\n"),
            Step::Reply("WINNERS|OK|1\n"),
        ])
        .await;
        let client = client_loop(
            &server,
            sample_bets("1", 1),
            10,
            Duration::ZERO,
            CancellationToken::new(),
        );
        let err = client.run().await.expect_err("fatal");
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(server.connections().len(), 3);
    }

    #[tokio::test]
    async fn oversize_record_is_fatal_before_any_send() {
        let server = ScriptedServer::start(vec![Step::Reply("ACK_BATCH|OK|1\n")]).await;
        let mut bets = sample_bets("1", 1);
        bets[0].last_name = "x".repeat(DEFAULT_MAX_FRAME_BYTES);
        let client = client_loop(&server, bets, 10, Duration::ZERO, CancellationToken::new());
        let err = client.run().await.expect_err("fatal");
        assert!(matches!(err, Error::RecordTooLarge { .. }));
        assert!(server.connections().is_empty());
    }
}
