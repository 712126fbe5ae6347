//! Table entries for the data-driven bring-up phases

use std::time::Duration;

/// One register write of a bring-up phase, with the delay that must follow it
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Step {
    pub address: u16,
    pub value: u32,
    pub settle: Duration,
}

impl Step {
    #[must_use]
    pub const fn write(address: u16, value: u32) -> Self {
        Self {
            address,
            value,
            settle: Duration::ZERO,
        }
    }

    /// The same write followed by a wait of `ms` milliseconds
    #[must_use]
    pub const fn then_wait(self, ms: u64) -> Self {
        Self {
            settle: Duration::from_millis(ms),
            ..self
        }
    }
}

/// Shorthand for a table of plain writes
macro_rules! steps {
    ($(($addr:expr, $value:expr)),* $(,)?) => {
        &[$($crate::sequence::Step::write($addr, $value)),*]
    };
}

pub(crate) use steps;

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &[Step] = steps![(0x100, 0x0A), (0x101, 0x00)];

    #[test]
    fn test_steps() {
        assert_eq!(TABLE.len(), 2);
        assert_eq!(TABLE[0], Step::write(0x100, 0x0A));
        assert_eq!(TABLE[1].settle, Duration::ZERO);
        let step = Step::write(0x02B0, 0x01).then_wait(500);
        assert_eq!(step.settle, Duration::from_millis(500));
        assert_eq!(step.address, 0x02B0);
    }
}
