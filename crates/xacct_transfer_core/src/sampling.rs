use rand::seq::index;
use rand::Rng;

pub const DEFAULT_SAMPLE_SIZE: usize = 10;

/// Draws `min(sample_size, population)` distinct indices in `0..population`.
pub fn sample_indices(population: usize, sample_size: usize, rng: &mut impl Rng) -> Vec<usize> {
    let amount = sample_size.min(population);
    if amount == 0 {
        return Vec::new();
    }
    index::sample(rng, population, amount).into_vec()
}
