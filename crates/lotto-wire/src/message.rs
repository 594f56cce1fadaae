// Typed requests and replies with their pipe-delimited text encoding.
//
// Every payload is a single `\n`-terminated line, tag first. Encoding is a pure
// function of the input so the packer can predict sizes without doing I/O.
use bytes::Bytes;
use std::fmt;

use crate::{Error, Result};

pub const SEPARATOR: char = '|';
const LIST_SEPARATOR: &str = ",";
const RESERVED: [char; 3] = [SEPARATOR, '\n', '\r'];

pub mod tags {
    pub const BET: &str = "BET";
    pub const BATCH: &str = "BATCH";
    pub const DONE: &str = "DONE";
    pub const GET_WINNERS: &str = "GET_WINNERS";
    pub const ACK: &str = "ACK";
    pub const ACK_BATCH: &str = "ACK_BATCH";
    pub const ACK_DONE: &str = "ACK_DONE";
    pub const WINNERS: &str = "WINNERS";
    pub const OK: &str = "OK";
    pub const ERR: &str = "ERR";
}

/// A single lottery bet placed through an agency.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bet {
    pub agency: String,
    pub first_name: String,
    pub last_name: String,
    pub document: String,
    pub birthdate: String,
    pub number: i64,
}

impl Bet {
    fn text_fields(&self) -> [(&'static str, &str); 5] {
        [
            ("agency", &self.agency),
            ("first_name", &self.first_name),
            ("last_name", &self.last_name),
            ("document", &self.document),
            ("birthdate", &self.birthdate),
        ]
    }

    /// Rejects values that would break the line framing. Separators are not
    /// escaped on the wire.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in self.text_fields() {
            if value.contains(RESERVED) {
                return Err(Error::InvalidField { field });
            }
        }
        Ok(())
    }

    /// Exact length of `encode_line()` without building the string.
    pub fn line_len(&self) -> usize {
        let text: usize = self.text_fields().iter().map(|(_, value)| value.len()).sum();
        // Five separators and the trailing newline.
        text + signed_digits(self.number) + 6
    }

    /// Bare record line as sent inside a batch: `agency|nombre|apellido|documento|nacimiento|numero\n`.
    pub fn encode_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}\n",
            self.agency,
            self.first_name,
            self.last_name,
            self.document,
            self.birthdate,
            self.number
        )
    }

    pub fn decode_line(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let fields: Vec<&str> = line.split(SEPARATOR).collect();
        let [agency, first_name, last_name, document, birthdate, number] = fields[..] else {
            return Err(Error::Malformed(format!(
                "bet line has {} fields, expected 6",
                fields.len()
            )));
        };
        Ok(Self {
            agency: agency.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            document: document.to_string(),
            birthdate: birthdate.to_string(),
            number: parse_number(number),
        })
    }
}

/// Parses a base-10 signed integer; anything unparsable becomes zero.
pub fn parse_number(value: &str) -> i64 {
    value.trim().parse().unwrap_or(0)
}

fn signed_digits(value: i64) -> usize {
    let sign = usize::from(value < 0);
    sign + unsigned_digits(value.unsigned_abs())
}

fn unsigned_digits(mut value: u64) -> usize {
    let mut digits = 1;
    while value >= 10 {
        value /= 10;
        digits += 1;
    }
    digits
}

/// Length of `BATCH|agency|count\n`.
pub fn batch_header_len(agency: &str, count: usize) -> usize {
    tags::BATCH.len() + 1 + agency.len() + 1 + unsigned_digits(count as u64) + 1
}

/// Exact encoded size of a batch: header line plus every member line.
pub fn batch_encoded_len(agency: &str, bets: &[Bet]) -> usize {
    batch_header_len(agency, bets.len()) + bets.iter().map(Bet::line_len).sum::<usize>()
}

fn validate_agency(agency: &str) -> Result<()> {
    if agency.is_empty() || agency.contains(RESERVED) {
        return Err(Error::InvalidField { field: "agency" });
    }
    Ok(())
}

/// Client-to-server requests. Each one is answered by exactly one [`Reply`].
///
/// ```
/// use lotto_wire::Request;
///
/// let request = Request::Done { agency: "3".to_string() };
/// let payload = request.encode().expect("encode");
/// assert_eq!(&payload[..], b"DONE|3\n");
/// assert_eq!(Request::decode(&payload).expect("decode"), request);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    // One bet, answered by ACK.
    Bet(Bet),
    // Batch header; `count` bare bet lines follow in their own frames.
    Batch { agency: String, count: usize },
    // The agency has submitted its full dataset.
    Done { agency: String },
    // Ask for the agency's winners once every agency is done.
    GetWinners { agency: String },
}

impl Request {
    pub fn encode(&self) -> Result<Bytes> {
        let line = match self {
            Request::Bet(bet) => {
                bet.validate()?;
                format!("{}|{}", tags::BET, bet.encode_line())
            }
            Request::Batch { agency, count } => {
                validate_agency(agency)?;
                format!("{}|{agency}|{count}\n", tags::BATCH)
            }
            Request::Done { agency } => {
                validate_agency(agency)?;
                format!("{}|{agency}\n", tags::DONE)
            }
            Request::GetWinners { agency } => {
                validate_agency(agency)?;
                format!("{}|{agency}\n", tags::GET_WINNERS)
            }
        };
        Ok(Bytes::from(line))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let line = payload_line(payload)?;
        let (tag, rest) = line.split_once(SEPARATOR).unwrap_or((line, ""));
        match tag {
            tags::BET => Ok(Request::Bet(Bet::decode_line(rest)?)),
            tags::BATCH => {
                let (agency, count) = rest
                    .split_once(SEPARATOR)
                    .ok_or_else(|| Error::Malformed("batch header without count".into()))?;
                let count = count
                    .parse::<usize>()
                    .map_err(|_| Error::Malformed(format!("invalid batch count {count:?}")))?;
                Ok(Request::Batch {
                    agency: non_empty_agency(agency)?,
                    count,
                })
            }
            tags::DONE => Ok(Request::Done {
                agency: non_empty_agency(rest)?,
            }),
            tags::GET_WINNERS => Ok(Request::GetWinners {
                agency: non_empty_agency(rest)?,
            }),
            other => Err(Error::Malformed(format!("unknown request tag {other:?}"))),
        }
    }

    pub fn reply_kind(&self) -> ReplyKind {
        match self {
            Request::Bet(_) => ReplyKind::Ack,
            Request::Batch { .. } => ReplyKind::AckBatch,
            Request::Done { .. } => ReplyKind::AckDone,
            Request::GetWinners { .. } => ReplyKind::Winners,
        }
    }
}

fn non_empty_agency(value: &str) -> Result<String> {
    if value.is_empty() || value.contains(SEPARATOR) {
        return Err(Error::Malformed(format!("invalid agency {value:?}")));
    }
    Ok(value.to_string())
}

fn payload_line(payload: &[u8]) -> Result<&str> {
    let line = std::str::from_utf8(payload)
        .map_err(|_| Error::Malformed("payload is not utf-8".into()))?;
    Ok(line.trim_end_matches(['\r', '\n']))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Ack,
    AckBatch,
    AckDone,
    Winners,
}

impl ReplyKind {
    pub fn tag(self) -> &'static str {
        match self {
            ReplyKind::Ack => tags::ACK,
            ReplyKind::AckBatch => tags::ACK_BATCH,
            ReplyKind::AckDone => tags::ACK_DONE,
            ReplyKind::Winners => tags::WINNERS,
        }
    }
}

impl fmt::Display for ReplyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Server-to-client replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack,
    AckError { reason: String },
    AckBatch { count: usize },
    AckBatchError { reason: String },
    AckDone,
    // `ACK_DONE|ERR` carries no reason on the wire unless the server adds one.
    AckDoneError { reason: String },
    Winners { documents: Vec<String> },
    WinnersError { reason: String },
}

impl Reply {
    pub fn kind(&self) -> ReplyKind {
        match self {
            Reply::Ack | Reply::AckError { .. } => ReplyKind::Ack,
            Reply::AckBatch { .. } | Reply::AckBatchError { .. } => ReplyKind::AckBatch,
            Reply::AckDone | Reply::AckDoneError { .. } => ReplyKind::AckDone,
            Reply::Winners { .. } | Reply::WinnersError { .. } => ReplyKind::Winners,
        }
    }

    pub fn encode(&self) -> Bytes {
        let line = match self {
            Reply::Ack => format!("{}|{}\n", tags::ACK, tags::OK),
            Reply::AckError { reason } => error_line(tags::ACK, reason),
            Reply::AckBatch { count } => format!("{}|{}|{count}\n", tags::ACK_BATCH, tags::OK),
            Reply::AckBatchError { reason } => error_line(tags::ACK_BATCH, reason),
            Reply::AckDone => format!("{}|{}\n", tags::ACK_DONE, tags::OK),
            Reply::AckDoneError { reason } if reason.is_empty() => {
                format!("{}|{}\n", tags::ACK_DONE, tags::ERR)
            }
            Reply::AckDoneError { reason } => error_line(tags::ACK_DONE, reason),
            Reply::Winners { documents } => format!(
                "{}|{}|{}\n",
                tags::WINNERS,
                tags::OK,
                documents.join(LIST_SEPARATOR)
            ),
            Reply::WinnersError { reason } => error_line(tags::WINNERS, reason),
        };
        Bytes::from(line)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let line = payload_line(payload)?;
        let mut parts = line.splitn(3, SEPARATOR);
        let tag = parts.next().unwrap_or_default();
        let status = parts.next();
        let rest = parts.next();
        let ok = match status {
            Some(tags::OK) => true,
            Some(tags::ERR) => false,
            other => {
                return Err(Error::Malformed(format!(
                    "reply {tag:?} has invalid status {other:?}"
                )));
            }
        };
        let reason = || rest.unwrap_or_default().to_string();
        match (tag, ok) {
            (tags::ACK, true) => Ok(Reply::Ack),
            (tags::ACK, false) => Ok(Reply::AckError { reason: reason() }),
            (tags::ACK_BATCH, true) => {
                let raw = rest.unwrap_or_default();
                let count = raw
                    .parse::<usize>()
                    .map_err(|_| Error::Malformed(format!("invalid ack count {raw:?}")))?;
                Ok(Reply::AckBatch { count })
            }
            (tags::ACK_BATCH, false) => Ok(Reply::AckBatchError { reason: reason() }),
            (tags::ACK_DONE, true) => Ok(Reply::AckDone),
            (tags::ACK_DONE, false) => Ok(Reply::AckDoneError { reason: reason() }),
            (tags::WINNERS, true) => Ok(Reply::Winners {
                documents: rest
                    .unwrap_or_default()
                    .split(LIST_SEPARATOR)
                    .map(str::trim)
                    .filter(|document| !document.is_empty())
                    .map(str::to_string)
                    .collect(),
            }),
            (tags::WINNERS, false) => Ok(Reply::WinnersError { reason: reason() }),
            (other, _) => Err(Error::Malformed(format!("unknown reply tag {other:?}"))),
        }
    }

    /// Decodes a reply, failing with `UnexpectedReply` when its tag does not
    /// answer the request that was sent.
    pub fn decode_expecting(payload: &[u8], expected: ReplyKind) -> Result<Self> {
        let line = payload_line(payload)?;
        let tag = line.split(SEPARATOR).next().unwrap_or_default();
        if tag != expected.tag() {
            return Err(Error::UnexpectedReply {
                expected,
                got: tag.to_string(),
            });
        }
        Self::decode(payload)
    }
}

fn error_line(tag: &str, reason: &str) -> String {
    let reason: String = reason
        .chars()
        .map(|c| if matches!(c, '\n' | '\r') { ' ' } else { c })
        .collect();
    format!("{tag}|{}|{reason}\n", tags::ERR)
}
