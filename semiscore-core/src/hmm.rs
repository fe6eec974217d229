//! HMM topology as seen by the active-senone manager.
//!
//! The decoder owns its HMMs; the scorer only needs to know which senone
//! each emitting state uses. A state's senone is found through a senone
//! sequence id (ssid): `sequences[ssid][state]`. Non-multiplexed HMMs share
//! one ssid across all states; multiplexed HMMs carry one per state, and a
//! state may have none yet.

use crate::error::{Result, ScoreError};

pub trait HmmTopology {
    fn n_emit_state(&self) -> usize;

    fn is_multiplexed(&self) -> bool;

    /// Sub-model id of emitting state `state`. Non-multiplexed HMMs return
    /// the same id for every state.
    fn ssid(&self, state: usize) -> Option<u32>;
}

/// Senone sequences, one row of `n_emit_state` senones per ssid.
#[derive(Debug, Clone)]
pub struct SenoneSequences {
    n_emit_state: usize,
    senones: Vec<u32>,
}

impl SenoneSequences {
    pub fn new(n_emit_state: usize, senones: Vec<u32>) -> Result<Self> {
        if n_emit_state == 0 || senones.len() % n_emit_state != 0 {
            return Err(ScoreError::Config(format!(
                "{} senones do not form rows of {n_emit_state} emitting states",
                senones.len()
            )));
        }
        Ok(Self {
            n_emit_state,
            senones,
        })
    }

    pub fn n_emit_state(&self) -> usize {
        self.n_emit_state
    }

    pub fn n_ssid(&self) -> usize {
        self.senones.len() / self.n_emit_state
    }

    /// Senones of sequence `ssid`; empty if out of range.
    #[inline]
    pub fn row(&self, ssid: u32) -> &[u32] {
        let start = ssid as usize * self.n_emit_state;
        self.senones
            .get(start..start + self.n_emit_state)
            .unwrap_or(&[])
    }

    #[inline]
    pub fn senone(&self, ssid: u32, state: usize) -> Option<u32> {
        self.row(ssid).get(state).copied()
    }

    pub fn max_senone(&self) -> Option<u32> {
        self.senones.iter().copied().max()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SubModel {
    Shared(u32),
    PerState(Vec<Option<u32>>),
}

/// Minimal HMM instance: emitting-state count and sub-model ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hmm {
    n_emit_state: usize,
    sub_model: SubModel,
}

impl Hmm {
    pub fn new(n_emit_state: usize, ssid: u32) -> Self {
        Self {
            n_emit_state,
            sub_model: SubModel::Shared(ssid),
        }
    }

    pub fn multiplexed(ssids: Vec<Option<u32>>) -> Self {
        Self {
            n_emit_state: ssids.len(),
            sub_model: SubModel::PerState(ssids),
        }
    }
}

impl HmmTopology for Hmm {
    fn n_emit_state(&self) -> usize {
        self.n_emit_state
    }

    fn is_multiplexed(&self) -> bool {
        matches!(self.sub_model, SubModel::PerState(_))
    }

    fn ssid(&self, state: usize) -> Option<u32> {
        match &self.sub_model {
            SubModel::Shared(id) => Some(*id),
            SubModel::PerState(ids) => ids.get(state).copied().flatten(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_split_by_state_count() {
        let seq = SenoneSequences::new(3, vec![0, 1, 2, 5, 5, 7]).unwrap();
        assert_eq!(seq.n_ssid(), 2);
        assert_eq!(seq.row(1), &[5, 5, 7]);
        assert_eq!(seq.senone(0, 2), Some(2));
        assert!(seq.row(2).is_empty());
        assert_eq!(seq.max_senone(), Some(7));
        assert!(SenoneSequences::new(3, vec![0, 1]).is_err());
    }

    #[test]
    fn multiplexed_states_resolve_independently() {
        let hmm = Hmm::multiplexed(vec![Some(4), None, Some(1)]);
        assert!(hmm.is_multiplexed());
        assert_eq!(hmm.ssid(0), Some(4));
        assert_eq!(hmm.ssid(1), None);
        assert_eq!(hmm.ssid(3), None);

        let plain = Hmm::new(5, 2);
        assert!(!plain.is_multiplexed());
        assert_eq!(plain.ssid(4), Some(2));
    }
}
