//! Polling the factory-reset button and counting consecutive boots.

use crate::{
    error,
    hold::{Clock, ForceReason, Hold, HoldConfig, HoldPin, ResetHoldState, ResetReason},
    info,
};

/// Decides once per boot whether the factory-reset button was held.
///
/// Polling is a busy wait: nothing else can usefully run before the boot decision is made.
pub struct HoldDetector<P, C> {
    pin: P,
    clock: C,
    config: HoldConfig,
}

impl<P: HoldPin, C: Clock> HoldDetector<P, C> {
    pub fn new(pin: P, clock: C, config: HoldConfig) -> Self {
        Self { pin, clock, config }
    }

    pub fn release(self) -> (P, C) {
        (self.pin, self.clock)
    }

    /// Count this boot attempt and classify the button hold.
    ///
    /// Past `max_consecutive_boots` attempts a long hold is reported straight away, without
    /// looking at the pin. After a deep sleep wakeup a short hold is reported, also without
    /// looking at the pin.
    pub fn check(&mut self, state: &mut ResetHoldState<'_>, reset_reason: ResetReason) -> Hold {
        if !state.is_intact() || state.counter() < 0 || reset_reason == ResetReason::PowerOn {
            error!(
                "consecutive reset counter {}: garbage data, resetting to 0",
                state.counter()
            );
            state.reinitialize();
        }

        let counter = state.count_boot();
        error!("consecutive reset counter: {}", counter);

        if counter > self.config.max_consecutive_boots {
            error!(
                "Forcing factory due to consecutive resets: {}, max: {}",
                counter, self.config.max_consecutive_boots
            );
            state.record_reason(ForceReason::ConsecutiveResets);
            return Hold::LongHold;
        }

        if reset_reason == ResetReason::DeepSleep {
            return Hold::ShortHold;
        }

        let hold = self.poll();
        if hold == Hold::LongHold {
            state.record_reason(ForceReason::ButtonHeld);
        }
        hold
    }

    fn released(&mut self) -> bool {
        // A pin that cannot be read counts as released, never as a press.
        self.pin.is_high().unwrap_or(true)
    }

    fn poll(&mut self) -> Hold {
        self.pin.set_pull_up_input();

        let start = self.clock.now_ms();
        let mut second_start = start;

        if self.released() {
            return Hold::NotHeld;
        }

        let mut seconds = 0u32;
        loop {
            if self.released() {
                return Hold::ShortHold;
            }

            // Unsigned differences stay correct across a wrap of the timestamp.
            let now = self.clock.now_ms();
            if now.wrapping_sub(second_start) >= 1000 {
                second_start = now;
                seconds += 1;
                info!("Factory reset button held for {} s", seconds);
            }

            if now.wrapping_sub(start) / 1000 >= self.config.delay_sec {
                return Hold::LongHold;
            }
        }
    }
}
