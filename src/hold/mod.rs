//! Factory-reset hold detection.
//!
//! A small block of RAM that is not initialised on boot survives warm resets. It carries a
//! counter of consecutive boot attempts: once the running application stops acknowledging
//! its boots the counter climbs past a threshold and the factory image is forced, without
//! consulting the button. Otherwise the button is polled, see [`HoldDetector`].

use embedded_hal::digital::InputPin;
use serde::{Deserialize, Serialize};

mod detector;

pub use detector::HoldDetector;

/// Size of the reserved region, fixed by the linker configuration.
pub const RESET_HOLD_LEN: usize = 16;

/// Marks the region as initialised by a previous boot.
pub const INTEGRITY_MAGIC: u8 = 0xa5;

const MAGIC_AT: usize = 0;
const REASON_AT: usize = 1;
const COUNTER_AT: usize = 4;

/// How long the button was held.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Hold {
    NotHeld,
    ShortHold,
    LongHold,
}

/// Why the factory image was forced, as recorded in the reserved region.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ForceReason {
    None,
    ConsecutiveResets,
    ButtonHeld,
    Unknown(u8),
}

impl ForceReason {
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::ConsecutiveResets,
            2 => Self::ButtonHeld,
            other => Self::Unknown(other),
        }
    }

    pub const fn raw(self) -> u8 {
        match self {
            Self::None => 0,
            Self::ConsecutiveResets => 1,
            Self::ButtonHeld => 2,
            Self::Unknown(other) => other,
        }
    }
}

/// Cause of the last reset, as reported by the platform.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResetReason {
    /// Power was applied; retained RAM holds garbage.
    PowerOn,
    /// Woken up from deep sleep.
    DeepSleep,
    Software,
    Watchdog,
    Brownout,
    Other(u32),
}

impl ResetReason {
    /// Decode the reset reason register of the ESP32 PRO CPU.
    pub const fn from_esp32(code: u32) -> Self {
        match code {
            1 => Self::PowerOn,
            3 | 12 => Self::Software,
            4 | 7 | 8 | 9 | 11 | 13 | 16 => Self::Watchdog,
            5 => Self::DeepSleep,
            15 => Self::Brownout,
            other => Self::Other(other),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HoldConfig {
    /// Seconds the button must be held for a long hold.
    pub delay_sec: u32,
    /// Boot attempts tolerated before the factory image is forced.
    pub max_consecutive_boots: i32,
}

impl Default for HoldConfig {
    fn default() -> Self {
        Self {
            delay_sec: 5,
            max_consecutive_boots: 100,
        }
    }
}

/// The factory-reset button, active low.
pub trait HoldPin: InputPin {
    /// Configure the pin as input with the internal pull-up enabled.
    fn set_pull_up_input(&mut self);
}

/// Monotonic millisecond timestamp available early in boot.
///
/// The value may wrap around, readers only ever subtract two samples.
pub trait Clock {
    fn now_ms(&mut self) -> u32;
}

/// Accessor for the reserved region holding the reset-hold state.
///
/// Layout: integrity magic at 0, force reason at 1, two reserved bytes, the consecutive boot
/// counter as little endian `i32` at 4, eight reserved bytes.
pub struct ResetHoldState<'a> {
    raw: &'a mut [u8; RESET_HOLD_LEN],
}

impl<'a> ResetHoldState<'a> {
    pub fn new(raw: &'a mut [u8; RESET_HOLD_LEN]) -> Self {
        Self { raw }
    }

    /// Access the region at its fixed address.
    ///
    /// # Safety
    /// `addr` must be the start of the `RESET_HOLD_LEN` bytes reserved for this state by the
    /// linker script, and nothing else may access that memory while the accessor lives.
    pub unsafe fn from_address(addr: usize) -> ResetHoldState<'static> {
        let raw = unsafe { &mut *(addr as *mut [u8; RESET_HOLD_LEN]) };
        ResetHoldState::new(raw)
    }

    pub fn is_intact(&self) -> bool {
        self.raw[MAGIC_AT] == INTEGRITY_MAGIC
    }

    /// Zero the whole region, reserved bytes included, and mark it initialised.
    pub fn reinitialize(&mut self) {
        self.raw.fill(0);
        self.raw[MAGIC_AT] = INTEGRITY_MAGIC;
    }

    pub fn counter(&self) -> i32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.raw[COUNTER_AT..COUNTER_AT + 4]);
        i32::from_le_bytes(bytes)
    }

    fn set_counter(&mut self, counter: i32) {
        self.raw[COUNTER_AT..COUNTER_AT + 4].copy_from_slice(&counter.to_le_bytes());
    }

    /// Count one more boot attempt.
    pub(crate) fn count_boot(&mut self) -> i32 {
        let counter = self.counter().wrapping_add(1);
        self.set_counter(counter);
        counter
    }

    pub fn reason(&self) -> ForceReason {
        ForceReason::from_raw(self.raw[REASON_AT])
    }

    pub fn record_reason(&mut self, reason: ForceReason) {
        self.raw[REASON_AT] = reason.raw();
    }

    /// Called by the application once it booted successfully, ending the streak of
    /// consecutive boot attempts.
    pub fn acknowledge_boot(&mut self) {
        self.set_counter(0);
        self.record_reason(ForceReason::None);
    }

    pub fn as_bytes(&self) -> &[u8; RESET_HOLD_LEN] {
        &*self.raw
    }
}
