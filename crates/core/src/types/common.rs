//! Traits shared across domain models

/// Types that can check their own invariants
pub trait Validator {
    /// Every violated invariant, or `Ok` when there are none
    fn validate(&self) -> Result<(), Vec<String>>;

    fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}
