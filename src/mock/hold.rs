use core::convert::Infallible;

use embedded_hal::digital::{ErrorType, InputPin};

use crate::hold::{Clock, HoldPin};

/// Active low button, held for a number of reads.
pub struct MockPin {
    held_reads: Option<usize>,
    pub reads: usize,
    pub pulled_up: bool,
}

impl MockPin {
    pub fn released() -> Self {
        Self::held_for(0)
    }

    /// Held for `reads` reads, released afterwards.
    pub fn held_for(reads: usize) -> Self {
        Self {
            held_reads: Some(reads),
            reads: 0,
            pulled_up: false,
        }
    }

    /// Never released.
    pub fn held() -> Self {
        Self {
            held_reads: None,
            reads: 0,
            pulled_up: false,
        }
    }
}

impl ErrorType for MockPin {
    type Error = Infallible;
}

impl InputPin for MockPin {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        self.reads += 1;
        Ok(match self.held_reads {
            Some(held) => self.reads > held,
            None => false,
        })
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        self.is_high().map(|high| !high)
    }
}

impl HoldPin for MockPin {
    fn set_pull_up_input(&mut self) {
        self.pulled_up = true;
    }
}

/// Clock advancing by a fixed step on every sample.
pub struct StepClock {
    now: u32,
    step: u32,
    pub samples: usize,
}

impl StepClock {
    pub fn new(start: u32, step: u32) -> Self {
        Self {
            now: start,
            step,
            samples: 0,
        }
    }
}

impl Clock for StepClock {
    fn now_ms(&mut self) -> u32 {
        let now = self.now;
        self.now = self.now.wrapping_add(self.step);
        self.samples += 1;
        now
    }
}
