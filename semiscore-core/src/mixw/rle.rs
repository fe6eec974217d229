//! Run-length coding of 4-bit cluster-id rows.
//!
//! Each byte is one run: the high nibble is `run_length - 1`, the low nibble
//! the cluster id. A row's runs expand to exactly `n_sen` entries.

/// Longest run a single byte can express.
pub const MAX_RUN: usize = 16;

/// Iterator over `(run_length, cluster_id)` pairs of an encoded row.
#[derive(Debug, Clone)]
pub struct Runs<'a> {
    bytes: std::slice::Iter<'a, u8>,
}

impl<'a> Runs<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes: bytes.iter() }
    }
}

impl Iterator for Runs<'_> {
    type Item = (usize, u8);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.bytes.next().map(|&b| split(b))
    }
}

#[inline(always)]
pub fn split(b: u8) -> (usize, u8) {
    (usize::from(b >> 4) + 1, b & 0x0f)
}

/// Encode cluster ids (each < 16) as runs.
pub fn encode_row(ids: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut iter = ids.iter().map(|&id| id & 0x0f).peekable();
    while let Some(id) = iter.next() {
        let mut len = 1;
        while len < MAX_RUN && iter.peek() == Some(&id) {
            iter.next();
            len += 1;
        }
        out.push((((len - 1) as u8) << 4) | id);
    }
    out
}

/// Expand an encoded row.
pub fn decode_row(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for (len, id) in Runs::new(bytes) {
        out.extend(std::iter::repeat(id).take(len));
    }
    out
}

/// Consume runs from the front of `bytes` until at least `n_sen` entries
/// are covered. Returns `(bytes_consumed, entries_covered)`; the second
/// value differs from `n_sen` when the data ends early or the last run
/// overshoots.
pub fn measure_row(bytes: &[u8], n_sen: usize) -> (usize, usize) {
    let mut covered = 0;
    let mut used = 0;
    for &b in bytes {
        if covered >= n_sen {
            break;
        }
        covered += split(b).0;
        used += 1;
    }
    (used, covered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_runs_are_split_at_sixteen() {
        let ids = vec![3u8; 40];
        let enc = encode_row(&ids);
        assert_eq!(enc, vec![0xf3, 0xf3, 0x73]);
        assert_eq!(decode_row(&enc), ids);
    }

    #[test]
    fn measure_stops_at_row_end() {
        let mut bytes = encode_row(&[1, 1, 2, 2, 2]);
        let row_len = bytes.len();
        bytes.extend(encode_row(&[7; 5]));
        assert_eq!(measure_row(&bytes, 5), (row_len, 5));
        // Data ends before the row is complete.
        assert_eq!(measure_row(&bytes[..1], 5), (1, 2));
        // Last run overshoots.
        assert_eq!(measure_row(&[0x50], 4), (1, 6));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn decode_restores_encoded_row(ids in proptest::collection::vec(0u8..16, 1..300)) {
                let enc = encode_row(&ids);
                let total: usize = Runs::new(&enc).map(|(len, _)| len).sum();
                prop_assert_eq!(total, ids.len());
                prop_assert_eq!(decode_row(&enc), ids.clone());
                prop_assert_eq!(measure_row(&enc, ids.len()), (enc.len(), ids.len()));
            }
        }
    }
}
