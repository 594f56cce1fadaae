// TCP front end of the central server: one request per connection.
use anyhow::{Context, Result, bail};
use bytes::Bytes;
use lotto_wire::{Bet, FrameHeader, Reply, Request, check_payload_len};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CentralConfig;
use crate::registry::{DoneStatus, Registry};

// Pause after a failed accept (e.g. EMFILE) so the loop does not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct CentralServer {
    listener: TcpListener,
    registry: Arc<Registry>,
    config: Arc<CentralConfig>,
}

impl CentralServer {
    pub async fn bind(config: CentralConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind)
            .await
            .with_context(|| format!("bind {}", config.bind))?;
        let registry = Arc::new(Registry::from_config(&config));
        Ok(Self {
            listener,
            registry,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("listener address")
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        serve(self.listener, self.registry, self.config, shutdown).await
    }
}

/// Accepts connections until `shutdown` fires. Each connection is served on
/// its own task and is dropped (closed) if shutdown fires mid-request.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<Registry>,
    config: Arc<CentralConfig>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "central server listening");
    loop {
        let (mut stream, peer) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!(bets = registry.bet_count(), "central server stopped");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    if pause_after_accept_error(&shutdown).await {
                        info!(bets = registry.bet_count(), "central server stopped");
                        return Ok(());
                    }
                    continue;
                }
            },
        };
        debug!(%peer, "connection accepted");
        let registry = Arc::clone(&registry);
        let config = Arc::clone(&config);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {}
                result = handle_connection(&mut stream, &registry, &config) => {
                    if let Err(err) = result {
                        warn!(%peer, error = %err, "connection handler failed");
                    }
                }
            }
        });
    }
}

/// Waits out [`ACCEPT_RETRY_DELAY`]. Returns true if shutdown fired first.
async fn pause_after_accept_error(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => false,
    }
}

/// Serves exactly one request. Framing or decoding violations end the
/// connection without a reply.
pub async fn handle_connection<S>(
    stream: &mut S,
    registry: &Registry,
    config: &CentralConfig,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let max = config.max_frame_bytes;
    let Some(payload) = read_frame(stream, max).await? else {
        return Ok(());
    };
    let request = Request::decode(&payload).context("decode request")?;
    let reply = match request {
        Request::Bet(bet) => {
            bet.validate().context("validate bet")?;
            info!(
                agency = %bet.agency,
                dni = %bet.document,
                numero = bet.number,
                "action: apuesta_almacenada | result: success"
            );
            registry.store([bet]);
            Reply::Ack
        }
        Request::Batch { agency, count } => {
            receive_batch(stream, registry, config, &agency, count).await?
        }
        Request::Done { agency } => match registry.mark_done(&agency) {
            DoneStatus::Recorded => {
                info!(%agency, ready = registry.is_ready(), "action: agencia_finalizada | result: success");
                Reply::AckDone
            }
            DoneStatus::Repeated => Reply::AckDone,
            DoneStatus::Unknown => {
                warn!(%agency, "action: agencia_finalizada | result: fail | reason: unknown agency");
                Reply::AckDoneError {
                    reason: "unknown_agency".to_string(),
                }
            }
        },
        Request::GetWinners { agency } => match registry.winners(&agency) {
            Some(documents) => {
                info!(%agency, cant_ganadores = documents.len(), "action: ganadores | result: success");
                Reply::Winners { documents }
            }
            None => Reply::WinnersError {
                reason: "not_ready".to_string(),
            },
        },
    };
    write_frame(stream, &reply.encode(), max).await?;
    stream.shutdown().await.context("shutdown connection")?;
    Ok(())
}

async fn receive_batch<S>(
    stream: &mut S,
    registry: &Registry,
    config: &CentralConfig,
    agency: &str,
    count: usize,
) -> Result<Reply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if count == 0 || count > config.batch_max_amount {
        warn!(%agency, count, max = config.batch_max_amount, "batch count out of range");
        return Ok(Reply::AckBatchError {
            reason: format!("count {count} out of range"),
        });
    }
    let mut bets = Vec::with_capacity(count);
    let mut rejection = None;
    for index in 0..count {
        let Some(payload) = read_frame(stream, config.max_frame_bytes).await? else {
            bail!("peer closed after {index} of {count} batch lines");
        };
        // Keep draining the announced lines after a rejection so the reply
        // is still read by the peer.
        if rejection.is_some() {
            continue;
        }
        match decode_batch_line(&payload, agency) {
            Ok(bet) => bets.push(bet),
            Err(reason) => rejection = Some(format!("line {}: {reason}", index + 1)),
        }
    }
    if let Some(reason) = rejection {
        warn!(%agency, count, %reason, "action: apuesta_recibida | result: fail");
        return Ok(Reply::AckBatchError { reason });
    }
    let stored = registry.store(bets);
    info!(%agency, cantidad = stored, "action: apuesta_recibida | result: success");
    Ok(Reply::AckBatch { count: stored })
}

fn decode_batch_line(payload: &[u8], agency: &str) -> std::result::Result<Bet, String> {
    let line = std::str::from_utf8(payload).map_err(|_| "not utf-8".to_string())?;
    let bet = Bet::decode_line(line).map_err(|err| err.to_string())?;
    if bet.agency != agency {
        return Err(format!("agency {} does not match batch agency", bet.agency));
    }
    Ok(bet)
}

async fn read_frame<R>(recv: &mut R, max_frame_bytes: usize) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; FrameHeader::LEN];
    match recv.read_exact(&mut header_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err).context("read frame header"),
    }
    let header = FrameHeader::decode(&header_bytes, max_frame_bytes)
        .context("decode frame header")?;
    let mut payload = vec![0u8; header.length as usize];
    recv.read_exact(&mut payload)
        .await
        .context("read frame payload")?;
    Ok(Some(Bytes::from(payload)))
}

async fn write_frame<W>(send: &mut W, payload: &[u8], max_frame_bytes: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    check_payload_len(payload.len(), max_frame_bytes).context("encode reply")?;
    let mut header = [0u8; FrameHeader::LEN];
    FrameHeader::new(payload.len() as u32).encode_into(&mut header);
    send.write_all(&header).await.context("write frame header")?;
    send.write_all(payload).await.context("write frame payload")?;
    send.flush().await.context("flush reply")?;
    Ok(())
}
