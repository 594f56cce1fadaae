use anyhow::{Context, Result, bail};
use lotto_wire::DEFAULT_MAX_FRAME_BYTES;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;

// Central server configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct CentralConfig {
    // TCP listener bind address.
    pub bind: SocketAddr,
    // Number of agencies that must report DONE before winners are published.
    pub agencies: usize,
    // Explicit participant ids. When set, only these close the round and
    // `agencies` follows its length.
    pub agency_ids: Option<Vec<String>>,
    // Number drawn for this round.
    pub winning_number: i64,
    // Max payload bytes per frame, both directions.
    pub max_frame_bytes: usize,
    // Largest batch count accepted in a BATCH header.
    pub batch_max_amount: usize,
}

const DEFAULT_BIND: &str = "0.0.0.0:12345";
const DEFAULT_AGENCIES: usize = 5;
const DEFAULT_WINNING_NUMBER: i64 = 7574;
const DEFAULT_BATCH_MAX_AMOUNT: usize = 8192;

#[derive(Debug, Deserialize)]
struct CentralConfigOverride {
    bind: Option<String>,
    agencies: Option<usize>,
    agency_ids: Option<Vec<String>>,
    winning_number: Option<i64>,
    max_frame_bytes: Option<usize>,
    batch_max_amount: Option<usize>,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 12345)),
            agencies: DEFAULT_AGENCIES,
            agency_ids: None,
            winning_number: DEFAULT_WINNING_NUMBER,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            batch_max_amount: DEFAULT_BATCH_MAX_AMOUNT,
        }
    }
}

impl CentralConfig {
    pub fn from_env() -> Result<Self> {
        let bind = std::env::var("LOTTO_CENTRAL_BIND")
            .unwrap_or_else(|_| DEFAULT_BIND.to_string())
            .parse()
            .with_context(|| "parse LOTTO_CENTRAL_BIND")?;
        let agencies = std::env::var("LOTTO_AGENCIES")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_AGENCIES);
        let agency_ids = std::env::var("LOTTO_AGENCY_IDS")
            .ok()
            .map(|value| {
                parse_agency_ids(value.split(',')).with_context(|| "parse LOTTO_AGENCY_IDS")
            })
            .transpose()?;
        let winning_number = std::env::var("LOTTO_WINNING_NUMBER")
            .ok()
            .map(|value| {
                value
                    .trim()
                    .parse::<i64>()
                    .with_context(|| "parse LOTTO_WINNING_NUMBER")
            })
            .transpose()?
            .unwrap_or(DEFAULT_WINNING_NUMBER);
        let max_frame_bytes = std::env::var("LOTTO_MAX_FRAME_BYTES")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);
        let batch_max_amount = std::env::var("LOTTO_BATCH_MAX_AMOUNT_SERVER")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_BATCH_MAX_AMOUNT);
        let mut config = Self {
            bind,
            agencies,
            agency_ids: None,
            winning_number,
            max_frame_bytes,
            batch_max_amount,
        };
        if let Some(ids) = agency_ids {
            config.set_agency_ids(ids);
        }
        Ok(config)
    }

    fn set_agency_ids(&mut self, ids: Vec<String>) {
        self.agencies = ids.len();
        self.agency_ids = Some(ids);
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("LOTTO_CENTRAL_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read LOTTO_CENTRAL_CONFIG: {path}"))?;
            let override_cfg: CentralConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse central config yaml")?;
            if let Some(value) = override_cfg.bind {
                config.bind = value.parse().with_context(|| "parse bind")?;
            }
            if let Some(value) = override_cfg.agencies
                && value > 0
            {
                config.agencies = value;
            }
            if let Some(ids) = override_cfg.agency_ids {
                let ids = parse_agency_ids(ids.iter().map(String::as_str))
                    .with_context(|| "parse agency_ids")?;
                config.set_agency_ids(ids);
            }
            if let Some(value) = override_cfg.winning_number {
                config.winning_number = value;
            }
            if let Some(value) = override_cfg.max_frame_bytes
                && value > 0
            {
                config.max_frame_bytes = value;
            }
            if let Some(value) = override_cfg.batch_max_amount
                && value > 0
            {
                config.batch_max_amount = value;
            }
        }
        if config.max_frame_bytes > u32::MAX as usize {
            bail!("max frame bytes {} exceeds the length prefix", config.max_frame_bytes);
        }
        Ok(config)
    }
}

// Trims and dedups ids; an empty list is a configuration error.
fn parse_agency_ids<'a>(ids: impl Iterator<Item = &'a str>) -> Result<Vec<String>> {
    let mut parsed: Vec<String> = Vec::new();
    for id in ids.map(str::trim).filter(|id| !id.is_empty()) {
        if !parsed.iter().any(|seen| seen == id) {
            parsed.push(id.to_string());
        }
    }
    if parsed.is_empty() {
        bail!("agency list is empty");
    }
    Ok(parsed)
}
