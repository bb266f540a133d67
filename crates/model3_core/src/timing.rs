/*
    Model3

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    timing.rs

    Global tick clock and the one-shot pulse request used to schedule
    device callbacks against it.
*/

use crate::snapshot::PulseReqState;

/// Master clock rate of the machine in Hz.
pub const CLOCK_RATE: u64 = 2_027_520;

const MICROSECONDS_PER_MILLISECOND: u64 = 1000;
const MILLISECONDS_PER_SECOND: u64 = 1000;

/// Conversion between microseconds and clock ticks. Conversions go through
/// whole ticks per millisecond so that every device agrees on the rounding.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TickRate {
    ticks_per_second: u64,
    ticks_per_millisecond: u64,
}

impl Default for TickRate {
    fn default() -> Self {
        TickRate::new(CLOCK_RATE)
    }
}

impl TickRate {
    pub fn new(ticks_per_second: u64) -> Self {
        Self {
            ticks_per_second,
            ticks_per_millisecond: ticks_per_second / MILLISECONDS_PER_SECOND,
        }
    }

    pub fn ticks_per_second(&self) -> u64 {
        self.ticks_per_second
    }

    pub fn ticks_per_millisecond(&self) -> u64 {
        self.ticks_per_millisecond
    }

    #[inline]
    pub fn us_to_ticks(&self, us: u64) -> u64 {
        us * self.ticks_per_millisecond / MICROSECONDS_PER_MILLISECOND
    }

    #[inline]
    pub fn ticks_to_us(&self, ticks: u64) -> u64 {
        if self.ticks_per_millisecond == 0 {
            return 0;
        }
        ticks * MICROSECONDS_PER_MILLISECOND / self.ticks_per_millisecond
    }
}

/// A one-shot, re-armable request to be called back at an absolute tick.
///
/// The pulse does not watch the clock itself. Its holder compares the current
/// tick against [PulseReq::trigger] (or calls [PulseReq::poll]) and dispatches
/// the event returned by [PulseReq::execute]. Once executed the pulse stays
/// expired until it is armed again with [PulseReq::set_trigger].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PulseReq<E> {
    delay_us: u64,
    trigger: u64,
    expired: bool,
    event: E,
}

impl<E: Copy> PulseReq<E> {
    pub fn new(delay_us: u64, event: E, expired: bool) -> Self {
        Self {
            delay_us,
            trigger: 0,
            expired,
            event,
        }
    }

    pub fn delay_us(&self) -> u64 {
        self.delay_us
    }

    pub fn set_delay_us(&mut self, delay_us: u64) {
        self.delay_us = delay_us;
    }

    /// Arm the pulse to fire `delay_us` after `baseline`.
    pub fn set_trigger(&mut self, baseline: u64, rate: TickRate) {
        self.trigger = baseline + rate.us_to_ticks(self.delay_us);
        self.expired = false;
    }

    /// Set a new delay and arm the pulse in one step.
    pub fn arm(&mut self, delay_us: u64, baseline: u64, rate: TickRate) {
        self.delay_us = delay_us;
        self.set_trigger(baseline, rate);
    }

    pub fn trigger(&self) -> u64 {
        self.trigger
    }

    pub fn expired(&self) -> bool {
        self.expired
    }

    pub fn event(&self) -> E {
        self.event
    }

    /// Cancel the pulse without firing it.
    pub fn expire(&mut self) {
        self.expired = true;
    }

    pub fn is_due(&self, now: u64) -> bool {
        !self.expired && now >= self.trigger
    }

    /// Fire the pulse. Returns the event the first time after arming, `None`
    /// afterwards.
    pub fn execute(&mut self) -> Option<E> {
        if self.expired {
            return None;
        }
        self.expired = true;
        Some(self.event)
    }

    /// Fire the pulse if `now` has reached its trigger.
    pub fn poll(&mut self, now: u64) -> Option<E> {
        if self.is_due(now) {
            self.execute()
        }
        else {
            None
        }
    }

    pub fn save_state(&self) -> PulseReqState {
        PulseReqState {
            delay_us: self.delay_us,
            trigger:  self.trigger,
            expired:  self.expired,
        }
    }

    pub fn restore_state(&mut self, state: &PulseReqState) {
        self.delay_us = state.delay_us;
        self.trigger = state.trigger;
        self.expired = state.expired;
    }
}

/// The global tick counter.
#[derive(Clone, Debug, Default)]
pub struct Clock {
    ticks: u64,
    rate:  TickRate,
}

impl Clock {
    pub fn new(rate: TickRate) -> Self {
        Self { ticks: 0, rate }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn rate(&self) -> TickRate {
        self.rate
    }

    pub fn set_ticks(&mut self, ticks: u64) {
        self.ticks = ticks;
    }

    /// Advance the clock by `ticks`, returning the new tick count.
    pub fn advance(&mut self, ticks: u64) -> u64 {
        self.ticks += ticks;
        self.ticks
    }

    pub fn advance_us(&mut self, us: u64) -> u64 {
        let ticks = self.rate.us_to_ticks(us);
        self.advance(ticks)
    }

    pub fn elapsed_us(&self) -> u64 {
        self.rate.ticks_to_us(self.ticks)
    }
}
