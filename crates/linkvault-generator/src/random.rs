use crate::Generator;
use linkvault_core::shortcode::{ALPHABET, CODE_LENGTH};
use linkvault_core::ShortCode;
use rand::Rng;

/// Generates short codes by sampling every position uniformly and
/// independently from the 62-symbol alphabet.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomGenerator;

impl RandomGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl Generator for RandomGenerator {
    type Output = ShortCode;

    fn generate(&self) -> ShortCode {
        let mut rng = rand::rng();
        let code: String = (0..CODE_LENGTH)
            .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
            .collect();
        ShortCode::new_unchecked(code)
    }
}
