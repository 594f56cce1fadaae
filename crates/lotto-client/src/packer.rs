//! Adaptive batch packing.
//!
//! # Purpose
//! Turns a forward-only stream of bets into batches whose encoded size (the
//! `BATCH` header line plus every member line) stays within a byte budget,
//! while making every batch as large as that budget allows.
//!
//! # Design notes
//! The packer keeps a small look-ahead window. Filling stops at the record
//! cap, at an agency change, or as soon as the window no longer fits the
//! budget. The batch boundary is then found by binary searching the largest
//! prefix whose encoded size fits. Encoded size only grows with the number of
//! records, so the "fits" predicate is monotonic.
//!
//! Records are never reordered, split or dropped: each one lands in exactly one
//! batch, or packing fails with `RecordTooLarge` when a single record cannot fit
//! on its own.
use lotto_wire::{Bet, batch_encoded_len, batch_header_len};

use crate::error::{Error, Result};
use crate::source::RecordSource;

pub const DEFAULT_BATCH_MAX_RECORDS: usize = 100;

/// A non-empty run of bets from one agency that fits the byte budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    agency: String,
    bets: Vec<Bet>,
}

impl Batch {
    pub fn agency(&self) -> &str {
        &self.agency
    }

    pub fn bets(&self) -> &[Bet] {
        &self.bets
    }

    pub fn len(&self) -> usize {
        self.bets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bets.is_empty()
    }

    pub fn encoded_len(&self) -> usize {
        batch_encoded_len(&self.agency, &self.bets)
    }

    pub fn into_bets(self) -> Vec<Bet> {
        self.bets
    }
}

pub struct BatchPacker<S> {
    source: S,
    max_bytes: usize,
    max_records: usize,
    window: Vec<Bet>,
    // Sum of `line_len` over `window`.
    window_bytes: usize,
    exhausted: bool,
    failed: bool,
}

impl<S: RecordSource> BatchPacker<S> {
    pub fn new(source: S, max_bytes: usize, max_records: usize) -> Self {
        Self {
            source,
            max_bytes,
            max_records: max_records.max(1),
            window: Vec::new(),
            window_bytes: 0,
            exhausted: false,
            failed: false,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn max_records(&self) -> usize {
        self.max_records
    }

    fn window_full(&self) -> bool {
        let (Some(first), Some(last)) = (self.window.first(), self.window.last()) else {
            return false;
        };
        self.window.len() >= self.max_records
            || last.agency != first.agency
            || batch_header_len(&first.agency, self.window.len()) + self.window_bytes
                > self.max_bytes
    }

    fn fill_window(&mut self) -> Result<()> {
        while !self.exhausted && !self.window_full() {
            match self.source.next_record()? {
                Some(bet) => {
                    bet.validate().map_err(Error::InvalidRecord)?;
                    self.window_bytes += bet.line_len();
                    self.window.push(bet);
                }
                None => self.exhausted = true,
            }
        }
        Ok(())
    }

    /// Returns the next maximal batch, or `None` once the source is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        self.fill_window()?;
        let Some(first) = self.window.first() else {
            return Ok(None);
        };
        let agency = first.agency.clone();
        let run = self
            .window
            .iter()
            .take_while(|bet| bet.agency == agency)
            .count();
        let candidates = &self.window[..run];
        let max_bytes = self.max_bytes;
        let fits = |n: usize| batch_encoded_len(&agency, &candidates[..n]) <= max_bytes;

        if !fits(1) {
            return Err(Error::RecordTooLarge {
                len: batch_encoded_len(&agency, &candidates[..1]),
                max: max_bytes,
            });
        }

        // Largest n in [1, run] with fits(n).
        let (mut lo, mut hi) = (1, run);
        while lo < hi {
            let mid = lo + (hi - lo).div_ceil(2);
            if fits(mid) {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }

        let bets: Vec<Bet> = self.window.drain(..lo).collect();
        self.window_bytes -= bets.iter().map(Bet::line_len).sum::<usize>();
        Ok(Some(Batch { agency, bets }))
    }
}

impl<S: RecordSource> Iterator for BatchPacker<S> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let next = self.next_batch().transpose();
        if matches!(next, Some(Err(_))) {
            self.failed = true;
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::IterSource;
    use lotto_wire::DEFAULT_MAX_FRAME_BYTES;

    // Encodes to exactly 40 bytes per line for agency "1".
    fn bet(agency: &str, i: usize) -> Bet {
        Bet {
            agency: agency.to_string(),
            first_name: "Maria".to_string(),
            last_name: "Gomez".to_string(),
            document: (30_000_000 + i).to_string(),
            birthdate: "1990-05-17".to_string(),
            number: 10_000 + i as i64,
        }
    }

    fn bets(count: usize) -> Vec<Bet> {
        (0..count).map(|i| bet("1", i)).collect()
    }

    fn pack(input: Vec<Bet>, max_bytes: usize, max_records: usize) -> Result<Vec<Batch>> {
        BatchPacker::new(IterSource::new(input), max_bytes, max_records).collect()
    }

    fn assert_invariants(input: &[Bet], batches: &[Batch], max_bytes: usize, max_records: usize) {
        let flattened: Vec<Bet> = batches.iter().flat_map(|b| b.bets().to_vec()).collect();
        assert_eq!(flattened, input, "order and completeness");
        for (i, batch) in batches.iter().enumerate() {
            assert!(!batch.is_empty());
            assert!(batch.encoded_len() <= max_bytes, "batch {i} over budget");
            assert!(batch.len() <= max_records);
            assert!(batch.bets().iter().all(|bet| bet.agency == batch.agency()));
            if let Some(next) = batches.get(i + 1) {
                let successor = &next.bets()[0];
                let grown: Vec<Bet> = batch
                    .bets()
                    .iter()
                    .cloned()
                    .chain(std::iter::once(successor.clone()))
                    .collect();
                let could_grow = successor.agency == batch.agency()
                    && batch.len() < max_records
                    && batch_encoded_len(batch.agency(), &grown) <= max_bytes;
                assert!(!could_grow, "batch {i} is not maximal");
            }
        }
    }

    #[test]
    fn line_fixture_is_forty_bytes() {
        assert_eq!(bet("1", 0).line_len(), 40);
    }

    #[test]
    fn two_hundred_fifty_bets_fill_two_frames() {
        let input = bets(250);
        let batches = pack(input.clone(), DEFAULT_MAX_FRAME_BYTES, 1_000).expect("pack");
        // 204 * 40 + len("BATCH|1|204\n") = 8172 <= 8192; one more would overflow.
        assert_eq!(
            batches.iter().map(Batch::len).collect::<Vec<_>>(),
            vec![204, 46]
        );
        assert_invariants(&input, &batches, DEFAULT_MAX_FRAME_BYTES, 1_000);
    }

    #[test]
    fn record_cap_bounds_batches() {
        let input = bets(250);
        let batches =
            pack(input.clone(), DEFAULT_MAX_FRAME_BYTES, DEFAULT_BATCH_MAX_RECORDS).expect("pack");
        assert_eq!(
            batches.iter().map(Batch::len).collect::<Vec<_>>(),
            vec![100, 100, 50]
        );
        assert_invariants(&input, &batches, DEFAULT_MAX_FRAME_BYTES, DEFAULT_BATCH_MAX_RECORDS);
    }

    #[test]
    fn variable_sized_records_stay_maximal() {
        let input: Vec<Bet> = (0..300)
            .map(|i| {
                let mut bet = bet("1", i);
                bet.last_name = "x".repeat(1 + (i * 37) % 90);
                bet
            })
            .collect();
        for budget in [200, 512, 1_000, 4_096] {
            let batches = pack(input.clone(), budget, 1_000).expect("pack");
            assert_invariants(&input, &batches, budget, 1_000);
        }
    }

    #[test]
    fn header_digits_are_accounted_for() {
        // Nine records fit with a one digit count; the tenth would need two.
        let input = bets(10);
        let budget = batch_encoded_len("1", &input[..9]) + 40;
        let batches = pack(input.clone(), budget, 1_000).expect("pack");
        assert_eq!(batches[0].len(), 9);
        assert_invariants(&input, &batches, budget, 1_000);
    }

    #[test]
    fn agency_change_starts_a_new_batch() {
        let mut input = bets(3);
        input.push(bet("2", 3));
        input.push(bet("2", 4));
        input.push(bet("1", 5));
        let batches = pack(input.clone(), DEFAULT_MAX_FRAME_BYTES, 1_000).expect("pack");
        let shape: Vec<(&str, usize)> = batches.iter().map(|b| (b.agency(), b.len())).collect();
        assert_eq!(shape, vec![("1", 3), ("2", 2), ("1", 1)]);
        assert_invariants(&input, &batches, DEFAULT_MAX_FRAME_BYTES, 1_000);
    }

    #[test]
    fn single_oversize_record_fails() {
        let mut input = bets(2);
        input[1].last_name = "x".repeat(300);
        let mut packer = BatchPacker::new(IterSource::new(input), 200, 1_000);
        let first = packer.next_batch().expect("first").expect("batch");
        assert_eq!(first.len(), 1);
        let err = packer.next_batch().expect_err("oversize");
        assert!(matches!(err, Error::RecordTooLarge { max: 200, .. }));
    }

    #[test]
    fn iterator_stops_after_failure() {
        let mut input = bets(1);
        input[0].first_name = "y".repeat(500);
        let mut packer = BatchPacker::new(IterSource::new(input), 100, 10);
        assert!(matches!(packer.next(), Some(Err(Error::RecordTooLarge { .. }))));
        assert!(packer.next().is_none());
    }

    #[test]
    fn invalid_records_are_rejected() {
        let mut input = bets(1);
        input[0].document = "12|34".to_string();
        let err = pack(input, DEFAULT_MAX_FRAME_BYTES, 10).expect_err("invalid");
        assert!(matches!(err, Error::InvalidRecord(_)));
    }

    #[test]
    fn empty_source_yields_nothing() {
        let batches = pack(Vec::new(), DEFAULT_MAX_FRAME_BYTES, 10).expect("pack");
        assert!(batches.is_empty());
    }
}
