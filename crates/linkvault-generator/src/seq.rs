use crate::Generator;
use linkvault_core::shortcode::CODE_LENGTH;
use linkvault_core::ShortCode;
use std::sync::atomic::{AtomicU64, Ordering};

/// A deterministic short code generator using a sequential counter.
///
/// This generator produces codes like "wh000000", "wh000001", etc.: the
/// prefix followed by the counter, zero-padded to the full code length.
/// Useful for reproducible runs and for tests that need to force
/// collisions.
#[derive(Debug)]
pub struct SeqGenerator {
    counter: AtomicU64,
    prefix: String,
}

impl Clone for SeqGenerator {
    fn clone(&self) -> Self {
        Self {
            counter: AtomicU64::new(self.counter.load(Ordering::SeqCst)),
            prefix: self.prefix.clone(),
        }
    }
}

impl SeqGenerator {
    /// Creates a new sequential generator with a custom prefix.
    ///
    /// The prefix should be alphanumeric and shorter than the code length.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self::with_offset(prefix, 0)
    }

    /// Creates a new sequential generator starting from a specific counter value.
    ///
    /// Useful for resuming from a known state or distributing
    /// counter ranges across processes.
    pub fn with_offset(prefix: impl Into<String>, offset: u64) -> Self {
        Self {
            counter: AtomicU64::new(offset),
            prefix: prefix.into(),
        }
    }
}

impl Generator for SeqGenerator {
    type Output = ShortCode;

    fn generate(&self) -> ShortCode {
        let count = self.counter.fetch_add(1, Ordering::SeqCst);
        let width = CODE_LENGTH.saturating_sub(self.prefix.len());
        ShortCode::new_unchecked(format!("{}{:0width$}", self.prefix, count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_generator_produces_sequential_codes() {
        let generator = SeqGenerator::with_prefix("wh");

        assert_eq!(generator.generate().as_str(), "wh000000");
        assert_eq!(generator.generate().as_str(), "wh000001");
        assert_eq!(generator.generate().as_str(), "wh000002");
    }

    #[test]
    fn seq_generator_codes_are_valid() {
        let generator = SeqGenerator::with_prefix("node");

        let code = generator.generate();
        assert_eq!(code.as_str(), "node0000");
        assert!(ShortCode::new(code.as_str()).is_ok());
    }

    #[test]
    fn seq_generator_with_offset() {
        let generator = SeqGenerator::with_offset("wh", 1000);

        assert_eq!(generator.generate().as_str(), "wh001000");
        assert_eq!(generator.generate().as_str(), "wh001001");
    }

    #[test]
    fn clone_preserves_counter_state() {
        let generator = SeqGenerator::with_prefix("wh");
        generator.generate();
        generator.generate();

        let cloned = generator.clone();

        assert_eq!(generator.generate().as_str(), "wh000002");
        assert_eq!(cloned.generate().as_str(), "wh000002");
    }
}
