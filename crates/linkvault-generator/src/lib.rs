pub mod random;
pub mod seq;

use linkvault_core::ShortCode;

pub use random::RandomGenerator;
pub use seq::SeqGenerator;

/// Trait for generating short codes.
///
/// Implementations are pure generators that don't interact with storage.
/// They give no uniqueness guarantee: collisions are detected by the
/// repository on insertion, which is why callers hand it several candidates.
pub trait Generator: Send + Sync + 'static {
    type Output: Into<ShortCode>;

    /// Generates a type that can be converted into a candidate short code.
    fn generate(&self) -> Self::Output;

    /// Generates `count` candidate codes for a single insertion.
    fn candidates(&self, count: usize) -> Vec<ShortCode> {
        (0..count).map(|_| self.generate().into()).collect()
    }
}
