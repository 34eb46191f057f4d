use crate::corpus::CorpusEntry;
use crate::input::Input;
use rand::Rng;
use rand_core::RngCore;

/// Chance, out of this many, that a mutation appends a byte instead of changing one.
const APPEND_ONE_IN: u32 = 4;

/// A `Mutator` is responsible for transforming a corpus entry into a new input.
///
/// The scheduler decides which entry is mutated; the mutator only decides how.
pub trait Mutator<I: Input> {
    /// Produces a new input derived from `entry`.
    ///
    /// # Returns
    /// `Result<I, anyhow::Error>`:
    ///   - `Ok(new_input)`: The newly generated or mutated input.
    ///   - `Err(error)`: If any error occurred during the mutation process.
    fn mutate(&mut self, entry: &CorpusEntry<I>, rng: &mut dyn RngCore)
    -> Result<I, anyhow::Error>;
}

/// A simple `Mutator` that changes a single random byte.
///
/// The byte is either nudged by a small value (1-15) or replaced by a different random
/// value. Sometimes a random byte is appended instead, leaving the existing bytes intact
/// so inputs can grow. An empty input is treated as a single zero byte. The result
/// always differs from the input.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlipSingleByteMutator;

impl FlipSingleByteMutator {
    pub fn new() -> Self {
        FlipSingleByteMutator
    }
}

impl<I> Mutator<I> for FlipSingleByteMutator
where
    I: Input + From<Vec<u8>>,
{
    fn mutate(
        &mut self,
        entry: &CorpusEntry<I>,
        rng: &mut dyn RngCore,
    ) -> Result<I, anyhow::Error> {
        let mut input_bytes = entry.input().as_bytes().to_vec();
        if !input_bytes.is_empty() && rng.random_ratio(1, APPEND_ONE_IN) {
            input_bytes.push(rng.random());
            return Ok(I::from(input_bytes));
        }
        if input_bytes.is_empty() {
            // Ensure there's at least one byte to mutate
            input_bytes.push(0);
        }

        let byte_index_to_mutate = rng.random_range(0..input_bytes.len());
        let byte = &mut input_bytes[byte_index_to_mutate];
        if rng.random_bool(0.5) {
            *byte = byte.wrapping_add(rng.random_range(1u8..=15u8));
        } else {
            // A non-zero mask always yields a different value.
            *byte ^= rng.random_range(1u8..=255u8);
        }

        Ok(I::from(input_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::EdgeIndex;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn entry(bytes: &[u8]) -> CorpusEntry<Vec<u8>> {
        CorpusEntry::new(bytes.to_vec(), [EdgeIndex::new(0)], "test")
    }

    #[test]
    fn flip_single_byte_mutator_mutates_input() {
        let mut mutator = FlipSingleByteMutator::new();
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        let original = entry(&[10, 20, 30, 40, 50]);

        for _ in 0..64 {
            let mutated: Vec<u8> = mutator.mutate(&original, &mut rng).unwrap();
            assert_ne!(&mutated, original.input());
            let changed = mutated[..5]
                .iter()
                .zip(original.input())
                .filter(|(a, b)| a != b)
                .count();
            match mutated.len() {
                5 => assert_eq!(changed, 1, "Exactly one existing byte changes"),
                6 => assert_eq!(changed, 0, "Appending keeps the existing bytes"),
                len => panic!("Unexpected length {len}"),
            }
        }
    }

    #[test]
    fn flip_single_byte_mutator_handles_empty_input() {
        let mut mutator = FlipSingleByteMutator::new();
        let mut rng = ChaCha8Rng::from_seed([1; 32]);
        let empty = entry(&[]);

        let mutated: Vec<u8> = mutator.mutate(&empty, &mut rng).unwrap();
        assert!(!mutated.is_empty());
        assert_ne!(mutated[0], 0);
    }

    #[test]
    fn flip_single_byte_mutator_eventually_grows_inputs() {
        let mut mutator = FlipSingleByteMutator::new();
        let mut rng = ChaCha8Rng::from_seed([2; 32]);
        let original = entry(b"A");
        let grew = (0..64).any(|_| {
            let mutated: Vec<u8> = mutator.mutate(&original, &mut rng).unwrap();
            mutated.len() == 2 && mutated[0] == b'A'
        });
        assert!(grew, "A climbable prefix must survive growth");
    }
}
