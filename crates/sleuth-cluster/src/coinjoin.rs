//! CoinJoin shape detection.
//!
//! Transactions that look like equal-output mixes are kept out of the
//! common-input-ownership merge: their inputs belong to different people.

use std::collections::{BTreeMap, HashSet};

use bitcoin::Transaction;
use sleuth_core::constants::DUST_GROUP_COUNTS;

/// Whether `tx` has the shape of a CoinJoin.
///
/// Needs at least two inputs and three outputs. With
/// `participants = ceil(outputs / 2)`, there must be at least that many
/// inputs and distinct funding transactions, and the second output-value
/// group (values descending) must have exactly `participants` members. A
/// first group whose size is a dust count is treated as change, not a mix.
pub fn is_coinjoin(tx: &Transaction) -> bool {
    let inputs = tx.input.len();
    let outputs = tx.output.len();
    if inputs < 2 || outputs < 3 {
        return false;
    }

    let participants = outputs.div_ceil(2);
    if participants > inputs {
        return false;
    }

    let distinct_sources = tx
        .input
        .iter()
        .map(|i| i.previous_output.txid)
        .collect::<HashSet<_>>()
        .len();
    if participants > distinct_sources {
        return false;
    }

    let groups = value_groups(tx);
    let Some(&(_, second)) = groups.get(1) else {
        return false;
    };
    if second != participants {
        return false;
    }

    let (_, first) = groups[0];
    !DUST_GROUP_COUNTS.contains(&first)
}

/// `(value, member count)` per distinct output value, largest value first.
fn value_groups(tx: &Transaction) -> Vec<(u64, usize)> {
    let mut counts: BTreeMap<u64, usize> = BTreeMap::new();
    for output in &tx.output {
        *counts.entry(output.value.to_sat()).or_default() += 1;
    }
    counts.into_iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Txid, Witness};

    fn source(seed: u16) -> Txid {
        let mut bytes = [0u8; 32];
        bytes[..2].copy_from_slice(&seed.to_le_bytes());
        bytes[31] = 1;
        Txid::from_byte_array(bytes)
    }

    fn tx(sources: &[u16], values: &[u64]) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: sources
                .iter()
                .enumerate()
                .map(|(i, s)| TxIn {
                    previous_output: OutPoint {
                        txid: source(*s),
                        vout: i as u32,
                    },
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: values
                .iter()
                .map(|v| TxOut {
                    value: Amount::from_sat(*v),
                    script_pubkey: ScriptBuf::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn classic_two_party_mix() {
        assert!(is_coinjoin(&tx(&[1, 2], &[90_000, 50_000, 50_000, 10_000])));
    }

    #[test]
    fn too_few_inputs_or_outputs() {
        assert!(!is_coinjoin(&tx(&[1], &[50_000, 50_000, 10_000])));
        assert!(!is_coinjoin(&tx(&[1, 2], &[50_000, 50_000])));
    }

    #[test]
    fn participants_exceed_inputs() {
        // 6 outputs → 3 participants, only 2 inputs
        assert!(!is_coinjoin(&tx(&[1, 2], &[9, 5, 5, 5, 1, 1])));
    }

    #[test]
    fn inputs_from_same_transaction() {
        assert!(!is_coinjoin(&tx(&[7, 7], &[90_000, 50_000, 50_000, 10_000])));
    }

    #[test]
    fn second_group_size_must_match() {
        // groups: 50_000 x2, 30_000 x1, 10_000 x1
        assert!(!is_coinjoin(&tx(&[1, 2], &[50_000, 50_000, 30_000, 10_000])));
    }

    #[test]
    fn all_distinct_values_is_not_a_mix() {
        assert!(!is_coinjoin(&tx(&[1, 2, 3], &[5, 4, 3])));
    }

    #[test]
    fn single_value_group_is_not_a_mix() {
        assert!(!is_coinjoin(&tx(&[1, 2], &[10, 10, 10])));
    }

    #[test]
    fn dust_sized_first_group_is_excluded() {
        // 546 x top value and 546 x next value: 546 participants, 546 sources
        let sources: Vec<u16> = (0..546).collect();
        let mut values = vec![1_000u64; 546];
        values.extend(vec![500u64; 546]);
        assert!(!is_coinjoin(&tx(&sources, &values)));

        // the same shape at a non-dust size is a mix
        let sources: Vec<u16> = (0..548).collect();
        let mut values = vec![1_000u64; 548];
        values.extend(vec![500u64; 548]);
        assert!(is_coinjoin(&tx(&sources, &values)));
    }

    #[test]
    fn three_party_mix_with_change() {
        // 5 outputs → 3 participants: largest change, three equal, small change
        assert!(is_coinjoin(&tx(&[1, 2, 3], &[80_000, 20_000, 20_000, 20_000, 5_000])));
    }
}
