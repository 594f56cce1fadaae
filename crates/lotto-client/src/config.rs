use anyhow::{Context, Result, bail};
use lotto_wire::DEFAULT_MAX_FRAME_BYTES;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::packer::DEFAULT_BATCH_MAX_RECORDS;

// Agency client configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // Agency identifier stamped on every bet.
    pub agency_id: String,
    // Central server `host:port`.
    pub server_address: String,
    // Max payload bytes per frame, both directions.
    pub max_frame_bytes: usize,
    // Max encoded bytes per batch; the frame cap when unset.
    pub batch_max_bytes: Option<usize>,
    // Max bets per batch.
    pub batch_max_records: usize,
    // Pause between acknowledged batches.
    pub loop_period: Duration,
    // Pause between winners polls.
    pub winners_backoff: Duration,
    // CSV file with this agency's bets.
    pub data_path: Option<PathBuf>,
}

const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1:12345";
const DEFAULT_LOOP_PERIOD_MS: u64 = 0;
const DEFAULT_WINNERS_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Default, Deserialize)]
struct ClientConfigOverride {
    agency_id: Option<String>,
    server_address: Option<String>,
    max_frame_bytes: Option<usize>,
    batch_max_bytes: Option<usize>,
    batch_max_records: Option<usize>,
    loop_period_ms: Option<u64>,
    winners_backoff_ms: Option<u64>,
    data_path: Option<PathBuf>,
}

fn env_positive<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            agency_id: "1".to_string(),
            server_address: DEFAULT_SERVER_ADDRESS.to_string(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            batch_max_bytes: None,
            batch_max_records: DEFAULT_BATCH_MAX_RECORDS,
            loop_period: Duration::from_millis(DEFAULT_LOOP_PERIOD_MS),
            winners_backoff: Duration::from_millis(DEFAULT_WINNERS_BACKOFF_MS),
            data_path: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let agency_id = std::env::var("LOTTO_AGENCY_ID")
            .map(|value| value.trim().to_string())
            .unwrap_or(defaults.agency_id);
        let server_address = std::env::var("LOTTO_SERVER_ADDRESS")
            .map(|value| value.trim().to_string())
            .unwrap_or(defaults.server_address);
        let max_frame_bytes =
            env_positive::<usize>("LOTTO_MAX_FRAME_BYTES").unwrap_or(defaults.max_frame_bytes);
        let batch_max_bytes = env_positive::<usize>("LOTTO_BATCH_MAX_BYTES");
        let batch_max_records = env_positive::<usize>("LOTTO_BATCH_MAX_AMOUNT")
            .unwrap_or(defaults.batch_max_records);
        // Zero is a valid period: submit back to back.
        let loop_period = std::env::var("LOTTO_LOOP_PERIOD_MS")
            .ok()
            .map(|value| {
                value
                    .trim()
                    .parse::<u64>()
                    .with_context(|| "parse LOTTO_LOOP_PERIOD_MS")
            })
            .transpose()?
            .map(Duration::from_millis)
            .unwrap_or(defaults.loop_period);
        let winners_backoff = env_positive::<u64>("LOTTO_WINNERS_BACKOFF_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.winners_backoff);
        let data_path = std::env::var_os("LOTTO_DATA_PATH").map(PathBuf::from);
        Ok(Self {
            agency_id,
            server_address,
            max_frame_bytes,
            batch_max_bytes,
            batch_max_records,
            loop_period,
            winners_backoff,
            data_path,
        })
    }

    /// Environment first, then the YAML file at `path` (or `LOTTO_CLIENT_CONFIG`).
    pub fn from_env_or_yaml(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_env()?;
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("LOTTO_CLIENT_CONFIG").map(PathBuf::from));
        if let Some(path) = path {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read client config: {}", path.display()))?;
            let override_cfg: ClientConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse client config yaml")?;
            config.apply(override_cfg);
        }
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, override_cfg: ClientConfigOverride) {
        if let Some(value) = override_cfg.agency_id {
            self.agency_id = value;
        }
        if let Some(value) = override_cfg.server_address {
            self.server_address = value;
        }
        if let Some(value) = override_cfg.max_frame_bytes
            && value > 0
        {
            self.max_frame_bytes = value;
        }
        if let Some(value) = override_cfg.batch_max_bytes
            && value > 0
        {
            self.batch_max_bytes = Some(value);
        }
        if let Some(value) = override_cfg.batch_max_records
            && value > 0
        {
            self.batch_max_records = value;
        }
        if let Some(value) = override_cfg.loop_period_ms {
            self.loop_period = Duration::from_millis(value);
        }
        if let Some(value) = override_cfg.winners_backoff_ms
            && value > 0
        {
            self.winners_backoff = Duration::from_millis(value);
        }
        if let Some(value) = override_cfg.data_path {
            self.data_path = Some(value);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.agency_id.is_empty() {
            bail!("agency id must not be empty");
        }
        if self.agency_id.contains(['|', '\n', '\r']) {
            bail!("agency id {:?} contains a reserved character", self.agency_id);
        }
        if self.server_address.is_empty() {
            bail!("server address must not be empty");
        }
        if let Some(budget) = self.batch_max_bytes
            && budget > self.max_frame_bytes
        {
            bail!(
                "batch budget {budget} exceeds the frame cap {}",
                self.max_frame_bytes
            );
        }
        Ok(())
    }

    pub fn effective_batch_max_bytes(&self) -> usize {
        self.batch_max_bytes.unwrap_or(self.max_frame_bytes)
    }
}
