// Record sources feeding the batch packer.
//
// A source is a single forward pass: once a bet is handed out it is never
// produced again.
use lotto_wire::Bet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::warn;

use crate::error::{Error, Result};

pub trait RecordSource {
    fn next_record(&mut self) -> Result<Option<Bet>>;
}

impl<S: RecordSource + ?Sized> RecordSource for Box<S> {
    fn next_record(&mut self) -> Result<Option<Bet>> {
        (**self).next_record()
    }
}

/// In-memory source over any iterator of bets.
pub struct IterSource<I> {
    inner: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = Bet>,
{
    pub fn new(inner: impl IntoIterator<IntoIter = I, Item = Bet>) -> Self {
        Self {
            inner: inner.into_iter(),
        }
    }
}

impl<I> RecordSource for IterSource<I>
where
    I: Iterator<Item = Bet>,
{
    fn next_record(&mut self) -> Result<Option<Bet>> {
        Ok(self.inner.next())
    }
}

/// Reads `nombre,apellido,documento,nacimiento,numero` lines for one agency.
pub struct CsvSource<R> {
    agency: String,
    reader: R,
    line: String,
    line_no: usize,
    defaulted_numbers: usize,
}

impl CsvSource<BufReader<File>> {
    pub fn open(agency: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(Error::Source)?;
        Ok(Self::new(agency, BufReader::new(file)))
    }
}

impl<R: BufRead> CsvSource<R> {
    pub fn new(agency: impl Into<String>, reader: R) -> Self {
        Self {
            agency: agency.into(),
            reader,
            line: String::new(),
            line_no: 0,
            defaulted_numbers: 0,
        }
    }

    /// Records whose number field was not an integer and was sent as 0.
    pub fn defaulted_numbers(&self) -> usize {
        self.defaulted_numbers
    }

    fn parse_line(&mut self, line: &str) -> Result<Bet> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let [first_name, last_name, document, birthdate, number] = fields[..] else {
            return Err(Error::MalformedRecord {
                line: self.line_no,
                reason: format!("expected 5 fields, found {}", fields.len()),
            });
        };
        let parsed = number.parse::<i64>().unwrap_or_else(|_| {
            self.defaulted_numbers += 1;
            warn!(
                agency = %self.agency,
                line = self.line_no,
                value = number,
                "bet number is not an integer; using 0"
            );
            0
        });
        Ok(Bet {
            agency: self.agency.clone(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            document: document.to_string(),
            birthdate: birthdate.to_string(),
            number: parsed,
        })
    }
}

impl<R: BufRead> RecordSource for CsvSource<R> {
    fn next_record(&mut self) -> Result<Option<Bet>> {
        loop {
            self.line.clear();
            let read = self.reader.read_line(&mut self.line).map_err(Error::Source)?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            if self.line.trim().is_empty() {
                continue;
            }
            // Parsing updates counters on self, so lend the buffer out.
            let line = std::mem::take(&mut self.line);
            let parsed = self.parse_line(line.trim_end_matches(['\r', '\n']));
            self.line = line;
            return parsed.map(Some);
        }
    }
}
