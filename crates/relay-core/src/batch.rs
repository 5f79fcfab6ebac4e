//! Greedy, order-preserving batch planning.

/// Maximum number of scores or claimable relays per ledger write.
pub const MAX_BATCH_SIZE: usize = 8;

/// Maximum number of family updates per ledger write.
pub const FAMILY_BATCH_SIZE: usize = 4;

/// Splits `items` into consecutive batches of at most `size` items.
///
/// Batches are filled greedily in input order and only the last batch may be
/// short. A `size` of zero is treated as one.
pub fn plan<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    items.chunks(size.max(1)).map(<[T]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seventeen_items_make_eight_eight_one() {
        let items: Vec<u32> = (0..17).collect();
        let batches = plan(&items, MAX_BATCH_SIZE);
        let lens: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(lens, vec![8, 8, 1]);
    }

    #[test]
    fn batches_cover_input_in_order_and_respect_size() {
        for len in [0usize, 1, 3, 4, 8, 9, 23] {
            let items: Vec<usize> = (0..len).collect();
            for size in [1usize, 4, 8] {
                let batches = plan(&items, size);
                assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= size));
                assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), len);
                let flat: Vec<usize> = batches.into_iter().flatten().collect();
                assert_eq!(flat, items);
            }
        }
    }

    #[test]
    fn zero_size_degrades_to_singletons() {
        let batches = plan(&["a", "b"], 0);
        assert_eq!(batches, vec![vec!["a"], vec!["b"]]);
    }
}
