//! Tenuring policy
//!
//! Decides where a surviving young object goes during a minor collection.

/// Where a surviving young object is copied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// The to-survivor, with its age incremented
    Survivor,
    /// The old generation, with its age reset
    Old,
}

/// Static age-threshold promotion policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenuringPolicy {
    threshold: u8,
}

impl TenuringPolicy {
    /// Create a policy promoting at `threshold` survived collections
    pub const fn new(threshold: u8) -> Self {
        Self { threshold }
    }

    /// Configured threshold
    pub const fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Whether an object of `age` is old enough to promote on this copy
    #[inline]
    pub fn should_promote(&self, age: u8) -> bool {
        age.saturating_add(1) >= self.threshold
    }

    /// Destination for an object of `age` and `size` given the space left
    /// in the to-survivor. Objects that do not fit are promoted on overflow.
    pub fn destination(&self, age: u8, size: usize, survivor_free: usize) -> Destination {
        if self.should_promote(age) || size > survivor_free {
            Destination::Old
        } else {
            Destination::Survivor
        }
    }

    /// Age an object carries after the copy
    #[inline]
    pub fn age_after(&self, age: u8, destination: Destination) -> u8 {
        match destination {
            Destination::Survivor => age.saturating_add(1),
            Destination::Old => 0,
        }
    }
}

impl Default for TenuringPolicy {
    fn default() -> Self {
        Self::new(crate::config::MAX_TENURING_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promotes_at_threshold() {
        let policy = TenuringPolicy::new(3);
        assert!(!policy.should_promote(0));
        assert!(!policy.should_promote(1));
        assert!(policy.should_promote(2));
        assert!(policy.should_promote(200));
    }

    #[test]
    fn test_overflow_promotes() {
        let policy = TenuringPolicy::default();
        assert_eq!(policy.threshold(), 15);
        assert_eq!(policy.destination(0, 64, 128), Destination::Survivor);
        assert_eq!(policy.destination(0, 256, 128), Destination::Old);
        assert_eq!(policy.destination(14, 64, 128), Destination::Old);
    }

    #[test]
    fn test_age_after_copy() {
        let policy = TenuringPolicy::new(4);
        assert_eq!(policy.age_after(2, Destination::Survivor), 3);
        assert_eq!(policy.age_after(3, Destination::Old), 0);
        assert_eq!(policy.age_after(u8::MAX, Destination::Survivor), u8::MAX);
    }

    #[test]
    fn test_threshold_one_promotes_everything() {
        let policy = TenuringPolicy::new(1);
        assert_eq!(policy.destination(0, 16, 1024), Destination::Old);
    }
}
