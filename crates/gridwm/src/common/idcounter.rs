use serde::{Deserialize, Serialize};

/// Monotone counter used to assign fresh row identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdCounter(u64);

impl IdCounter {
    pub fn new(initial_value: u64) -> Self {
        Self(initial_value)
    }

    pub fn increment(&mut self) -> u64 {
        let value = self.0;
        self.0 += 1;
        value
    }
}

impl Default for IdCounter {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::IdCounter;

    #[test]
    fn test_increment() {
        let mut counter = IdCounter::new(1);
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.increment(), 3);
    }
}
