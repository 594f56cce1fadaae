// Bet storage and round completion tracking.
//
// Winners are only published once every expected agency has reported DONE;
// before that no agency can learn anything about the draw. Without an explicit
// agency list any id counts towards the quorum, so a misconfigured agency can
// close the round early; configure the list to pin the participants.
use lotto_wire::Bet;
use parking_lot::Mutex;
use std::collections::HashSet;

use crate::config::CentralConfig;

#[derive(Debug, Default)]
struct RegistryState {
    bets: Vec<Bet>,
    done: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneStatus {
    Recorded,
    Repeated,
    // Not in the configured agency list; ignored for the quorum.
    Unknown,
}

#[derive(Debug)]
pub struct Registry {
    expected_agencies: usize,
    participants: Option<HashSet<String>>,
    winning_number: i64,
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new(expected_agencies: usize, winning_number: i64) -> Self {
        Self {
            expected_agencies,
            participants: None,
            winning_number,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Round closed by exactly these agencies; DONE from any other id is
    /// refused.
    pub fn with_participants<I, S>(agencies: I, winning_number: i64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let participants: HashSet<String> = agencies.into_iter().map(Into::into).collect();
        Self {
            expected_agencies: participants.len(),
            participants: Some(participants),
            winning_number,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn from_config(config: &CentralConfig) -> Self {
        match &config.agency_ids {
            Some(ids) => Self::with_participants(ids.iter().cloned(), config.winning_number),
            None => Self::new(config.agencies, config.winning_number),
        }
    }

    pub fn store<I>(&self, bets: I) -> usize
    where
        I: IntoIterator<Item = Bet>,
    {
        let mut state = self.state.lock();
        let before = state.bets.len();
        state.bets.extend(bets);
        state.bets.len() - before
    }

    /// Records that `agency` finished submitting.
    pub fn mark_done(&self, agency: &str) -> DoneStatus {
        if let Some(participants) = &self.participants
            && !participants.contains(agency)
        {
            return DoneStatus::Unknown;
        }
        if self.state.lock().done.insert(agency.to_string()) {
            DoneStatus::Recorded
        } else {
            DoneStatus::Repeated
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().done.len() >= self.expected_agencies
    }

    /// Documents of `agency`'s winning bets, in submission order, or `None`
    /// while the round is still open.
    pub fn winners(&self, agency: &str) -> Option<Vec<String>> {
        let state = self.state.lock();
        if state.done.len() < self.expected_agencies {
            return None;
        }
        Some(
            state
                .bets
                .iter()
                .filter(|bet| bet.agency == agency && bet.number == self.winning_number)
                .map(|bet| bet.document.clone())
                .collect(),
        )
    }

    pub fn bet_count(&self) -> usize {
        self.state.lock().bets.len()
    }
}
