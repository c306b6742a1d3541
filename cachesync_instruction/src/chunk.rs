//! Splitting large sets of instructions into log rows of bounded size.

use std::num::NonZeroUsize;

use crate::RefreshInstruction;

/// Split `instructions` into consecutive chunks holding at most `max_per_chunk` instructions.
///
/// Order is preserved and an instruction is never split, so concatenating the chunks gives back
/// the input. An empty input produces no chunks.
pub fn chunk_instructions(
    instructions: Vec<RefreshInstruction>,
    max_per_chunk: NonZeroUsize,
) -> Vec<Vec<RefreshInstruction>> {
    let max = max_per_chunk.get();
    let mut chunks = Vec::with_capacity(instructions.len().div_ceil(max));
    let mut iter = instructions.into_iter().peekable();
    while iter.peek().is_some() {
        chunks.push(iter.by_ref().take(max).collect());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachesync_id::RefresherId;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn instructions(n: usize) -> Vec<RefreshInstruction> {
        (0..n)
            .map(|i| {
                RefreshInstruction::refresh_by_ids(
                    RefresherId::from_uuid(Uuid::from_u128(1)),
                    [i as i64],
                )
            })
            .collect()
    }

    #[test]
    fn empty_input_gives_no_chunks() {
        let chunks = chunk_instructions(vec![], NonZeroUsize::new(3).unwrap());
        assert!(chunks.is_empty());
    }

    #[test]
    fn last_chunk_holds_the_remainder() {
        let chunks = chunk_instructions(instructions(7), NonZeroUsize::new(3).unwrap());
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    proptest! {
        #[test]
        fn chunks_are_bounded_and_concatenate_to_input(n in 0_usize..200, k in 1_usize..50) {
            let input = instructions(n);
            let chunks = chunk_instructions(input.clone(), NonZeroUsize::new(k).unwrap());

            prop_assert_eq!(chunks.len(), n.div_ceil(k));
            prop_assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= k));
            let joined: Vec<RefreshInstruction> = chunks.into_iter().flatten().collect();
            prop_assert_eq!(joined, input);
        }
    }
}
