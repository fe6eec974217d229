//! Active-senone set: one bit per senone, rebuilt by the decoder every
//! frame, then flattened into an ascending index list for the scorer.
//!
//! Per frame the decoder calls [`ActiveSenones::clear`], then
//! [`ActiveSenones::mark_hmm_active`] for each active HMM, then
//! [`ActiveSenones::flags_to_list`] exactly once before scoring.

use crate::hmm::{HmmTopology, SenoneSequences};

const WORD_BITS: usize = u64::BITS as usize;

#[derive(Debug, Clone)]
pub struct ActiveSenones {
    n_sen: usize,
    bits: Vec<u64>,
    list: Vec<u32>,
    /// Bits changed since the list was last built.
    dirty: bool,
}

impl ActiveSenones {
    pub fn new(n_sen: usize) -> Self {
        Self {
            n_sen,
            bits: vec![0; n_sen.div_ceil(WORD_BITS)],
            list: Vec::with_capacity(n_sen),
            dirty: false,
        }
    }

    pub fn n_senones(&self) -> usize {
        self.n_sen
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
        self.list.clear();
        self.dirty = true;
    }

    /// Out-of-range senones are ignored.
    #[inline]
    pub fn set(&mut self, sen: u32) {
        let sen = sen as usize;
        if sen < self.n_sen {
            self.bits[sen / WORD_BITS] |= 1 << (sen % WORD_BITS);
            self.dirty = true;
        }
    }

    pub fn is_set(&self, sen: u32) -> bool {
        let sen = sen as usize;
        sen < self.n_sen && self.bits[sen / WORD_BITS] & (1 << (sen % WORD_BITS)) != 0
    }

    /// Flag every senone used by the emitting states of `hmm`.
    pub fn mark_hmm_active(&mut self, hmm: &impl HmmTopology, sseq: &SenoneSequences) {
        let n_state = hmm.n_emit_state();
        if hmm.is_multiplexed() {
            for state in 0..n_state {
                if let Some(sen) = hmm.ssid(state).and_then(|ssid| sseq.senone(ssid, state)) {
                    self.set(sen);
                }
            }
            return;
        }

        let Some(ssid) = hmm.ssid(0) else {
            return;
        };
        let row = sseq.row(ssid);
        match &row[..n_state.min(row.len())] {
            &[s0, s1, s2] => {
                self.set(s0);
                self.set(s1);
                self.set(s2);
            }
            &[s0, s1, s2, s3, s4] => {
                self.set(s0);
                self.set(s1);
                self.set(s2);
                self.set(s3);
                self.set(s4);
            }
            senones => {
                for &sen in senones {
                    self.set(sen);
                }
            }
        }
    }

    /// Rebuild the ascending index list from the bits; returns its length.
    pub fn flags_to_list(&mut self) -> usize {
        self.list.clear();
        for (w, &word) in self.bits.iter().enumerate() {
            let mut rest = word;
            while rest != 0 {
                let b = rest.trailing_zeros() as usize;
                self.list.push((w * WORD_BITS + b) as u32);
                rest &= rest - 1;
            }
        }
        self.dirty = false;
        self.list.len()
    }

    /// The list as of the last [`flags_to_list`](Self::flags_to_list).
    pub fn list(&self) -> &[u32] {
        &self.list
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// True when bits were changed after the list was last built.
    pub fn is_stale(&self) -> bool {
        self.dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmm::Hmm;

    fn sequences() -> SenoneSequences {
        // ssid 0..3, three states each.
        SenoneSequences::new(3, vec![0, 1, 2, 70, 64, 70, 3, 2, 199]).unwrap()
    }

    #[test]
    fn list_is_sorted_and_deduplicated() {
        let mut active = ActiveSenones::new(200);
        let seq = sequences();
        active.clear();
        active.mark_hmm_active(&Hmm::new(3, 1), &seq);
        active.mark_hmm_active(&Hmm::new(3, 2), &seq);
        active.mark_hmm_active(&Hmm::new(3, 0), &seq);
        assert!(active.is_stale());
        assert_eq!(active.flags_to_list(), 7);
        assert_eq!(active.list(), &[0, 1, 2, 3, 64, 70, 199]);
        assert!(!active.is_stale());
    }

    #[test]
    fn multiplexed_hmm_uses_per_state_sequences() {
        let mut active = ActiveSenones::new(200);
        let hmm = Hmm::multiplexed(vec![Some(2), None, Some(1)]);
        active.mark_hmm_active(&hmm, &sequences());
        active.flags_to_list();
        assert_eq!(active.list(), &[3, 70]);
    }

    #[test]
    fn five_state_and_odd_topologies() {
        let seq = SenoneSequences::new(5, vec![9, 8, 7, 6, 5]).unwrap();
        let mut active = ActiveSenones::new(10);
        active.mark_hmm_active(&Hmm::new(5, 0), &seq);
        active.flags_to_list();
        assert_eq!(active.list(), &[5, 6, 7, 8, 9]);

        active.clear();
        active.mark_hmm_active(&Hmm::new(2, 0), &seq);
        active.flags_to_list();
        assert_eq!(active.list(), &[8, 9]);
    }

    #[test]
    fn clear_resets_everything() {
        let mut active = ActiveSenones::new(65);
        active.set(64);
        active.set(65);
        assert!(active.is_set(64));
        assert!(!active.is_set(65));
        assert_eq!(active.flags_to_list(), 1);
        active.clear();
        assert!(active.is_empty());
        assert_eq!(active.flags_to_list(), 0);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeSet;

        proptest! {
            #[test]
            fn list_matches_referenced_senones(
                n_state in prop_oneof![Just(3usize), Just(5usize), 1usize..7],
                table in proptest::collection::vec(0u32..300, 6..60),
                picks in proptest::collection::vec(any::<prop::sample::Index>(), 0..20),
            ) {
                let rows = table.len() / n_state;
                prop_assume!(rows > 0);
                let seq = SenoneSequences::new(n_state, table[..rows * n_state].to_vec()).unwrap();
                let mut active = ActiveSenones::new(300);
                active.clear();
                let mut expected = BTreeSet::new();
                for pick in &picks {
                    let ssid = pick.index(rows) as u32;
                    active.mark_hmm_active(&Hmm::new(n_state, ssid), &seq);
                    expected.extend(seq.row(ssid).iter().copied());
                }
                active.flags_to_list();
                prop_assert_eq!(active.list().to_vec(), expected.into_iter().collect::<Vec<_>>());
            }
        }
    }
}
