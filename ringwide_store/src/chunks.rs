//! Helpers for turning a sparse index-to-value map into Postgres
//! array-slice assignments: maximal runs of consecutive indexes, each
//! becoming one `col[$a:$b] = $c` clause.

use std::collections::BTreeMap;

/// One maximal run of consecutive indexes. `lo` is the 0-based index of
/// the first element; `values` is dense over `lo..=hi()`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Chunk<T> {
    pub lo: i32,
    pub values: Vec<T>,
}

impl<T> Chunk<T> {
    /// 0-based index of the last element in the run.
    pub fn hi(&self) -> i32 {
        self.lo + self.values.len() as i32 - 1
    }
}

/// Group a sparse map into maximal runs of consecutive keys, in key order.
pub(crate) fn chunk_runs<T: Clone>(map: &BTreeMap<i32, T>) -> Vec<Chunk<T>> {
    let mut chunks: Vec<Chunk<T>> = Vec::new();
    for (&idx, value) in map {
        match chunks.last_mut() {
            Some(chunk) if chunk.hi() + 1 == idx => chunk.values.push(value.clone()),
            _ => chunks.push(Chunk {
                lo: idx,
                values: vec![value.clone()],
            }),
        }
    }
    chunks
}

/// Build the SET fragment `col[$p:$p+1] = $p+2, ...` for `n` runs, with
/// placeholders numbered from `first_param`. The caller binds, per run and
/// in this order: the 1-based lower bound, the 1-based upper bound, and the
/// dense value array.
pub(crate) fn slice_set_clause(column: &str, n: usize, first_param: usize) -> String {
    let mut parts = Vec::with_capacity(n);
    let mut p = first_param;
    for _ in 0..n {
        parts.push(format!("{column}[${}:${}] = ${}", p, p + 1, p + 2));
        p += 3;
    }
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn map(entries: &[(i32, f64)]) -> BTreeMap<i32, f64> {
        entries.iter().copied().collect()
    }

    #[test]
    fn empty_map_no_chunks() {
        assert!(chunk_runs(&map(&[])).is_empty());
    }

    #[test]
    fn single_run() {
        let chunks = chunk_runs(&map(&[(3, 1.0), (4, 2.0), (5, 3.0)]));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].lo, 3);
        assert_eq!(chunks[0].hi(), 5);
        assert_eq!(chunks[0].values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn split_runs() {
        let chunks = chunk_runs(&map(&[(0, 1.0), (1, 2.0), (5, 3.0), (6, 4.0)]));
        assert_eq!(chunks.len(), 2);
        assert_eq!((chunks[0].lo, chunks[0].hi()), (0, 1));
        assert_eq!((chunks[1].lo, chunks[1].hi()), (5, 6));
    }

    #[test]
    fn set_clause_numbering() {
        assert_eq!(slice_set_clause("dp", 1, 4), "dp[$4:$5] = $6");
        assert_eq!(
            slice_set_clause("ver", 2, 7),
            "ver[$7:$8] = $9, ver[$10:$11] = $12"
        );
    }

    proptest! {
        // The union of chunked ranges equals the key set, chunks are
        // maximal, and dense payloads match the inputs in order.
        #[test]
        fn prop_chunks_partition_keys(keys in prop::collection::btree_set(0i32..500, 0..64)) {
            let map: BTreeMap<i32, f64> = keys.iter().map(|&k| (k, k as f64)).collect();
            let chunks = chunk_runs(&map);

            let mut covered = BTreeSet::new();
            let mut prev_hi: Option<i32> = None;
            for chunk in &chunks {
                // maximality: no chunk starts right after its predecessor
                if let Some(hi) = prev_hi {
                    prop_assert!(chunk.lo > hi + 1);
                }
                prev_hi = Some(chunk.hi());
                for (off, v) in chunk.values.iter().enumerate() {
                    let k = chunk.lo + off as i32;
                    prop_assert_eq!(*v, k as f64);
                    covered.insert(k);
                }
            }
            prop_assert_eq!(covered, keys);
        }
    }
}
