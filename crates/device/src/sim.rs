//! Simulated hardware, for tests and for dry runs on the host.
//!
//! All of the simulated parts share a [`SimClock`], and they update their
//! physical state lazily (whenever they are asked about it) according to
//! how much simulated time has passed. Nothing here ever sleeps.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::hal::{Clock, Drive, LinearDriver, StepperDriver, POT_CHANNEL};

/// A clock that only moves when someone waits on it.
#[derive(Clone, Debug, Default)]
pub struct SimClock {
    now: Arc<AtomicU64>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn delay_ms(&mut self, ms: u32) {
        self.advance(u64::from(ms));
    }
}

/// Microsteps per millisecond.
pub const STEPPER_RATE: f64 = 100.0;

#[derive(Debug)]
pub struct SimStepper {
    clock: SimClock,
    last_ms: u64,
    position: i32,
    target: i32,
    /// A stalled stepper never gets anywhere.
    pub stalled: bool,
}

impl SimStepper {
    pub fn new(clock: SimClock, position: i32) -> Self {
        Self {
            last_ms: clock.now_ms(),
            clock,
            position,
            target: position,
            stalled: false,
        }
    }

    pub fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    fn update(&mut self) {
        let now = self.clock.now_ms();
        let elapsed = now.saturating_sub(self.last_ms);
        self.last_ms = now;
        if self.stalled {
            return;
        }

        let max_step = (elapsed as f64 * STEPPER_RATE) as i64;
        let remaining = i64::from(self.target) - i64::from(self.position);
        let step = remaining.clamp(-max_step, max_step);
        self.position += step as i32;
    }
}

impl StepperDriver for SimStepper {
    fn set_step_target(&mut self, steps: i32) {
        self.update();
        self.target = steps;
    }

    fn position_reached(&mut self) -> bool {
        self.update();
        self.position == self.target
    }

    fn current_position(&mut self) -> i32 {
        self.update();
        self.position
    }

    fn stop(&mut self) {
        self.update();
        self.target = self.position;
    }
}

/// ADC counts per millisecond, at full power.
pub const ACTUATOR_RATE: f64 = 0.15;

#[derive(Debug)]
pub struct SimActuator {
    clock: SimClock,
    last_ms: u64,
    adc: f64,
    adc_min: u16,
    adc_max: u16,
    drive: Drive,
    /// How many times the motor output has been written.
    pub pwm_writes: usize,
    /// A stalled actuator never moves, no matter how hard it is driven.
    pub stalled: bool,
    /// Readings for the ADC channels that aren't wired to the potentiometer.
    pub aux: [u16; 4],
}

impl SimActuator {
    /// An actuator with end stops at `adc_min` and `adc_max`, currently
    /// reading `adc`.
    pub fn new(clock: SimClock, adc_min: u16, adc_max: u16, adc: u16) -> Self {
        Self {
            last_ms: clock.now_ms(),
            clock,
            adc: f64::from(adc.clamp(adc_min, adc_max)),
            adc_min,
            adc_max,
            drive: Drive::Stop,
            pwm_writes: 0,
            stalled: false,
            aux: [0, 0, 0, 0],
        }
    }

    pub fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    pub fn drive(&self) -> Drive {
        self.drive
    }

    fn update(&mut self) {
        let now = self.clock.now_ms();
        let elapsed = now.saturating_sub(self.last_ms) as f64;
        self.last_ms = now;
        if self.stalled {
            return;
        }

        let velocity = match self.drive {
            Drive::Stop => 0.0,
            Drive::Extend(duty) => ACTUATOR_RATE * f64::from(duty) / 100.0,
            Drive::Retract(duty) => -ACTUATOR_RATE * f64::from(duty) / 100.0,
        };
        self.adc = (self.adc + velocity * elapsed)
            .clamp(f64::from(self.adc_min), f64::from(self.adc_max));
    }
}

impl LinearDriver for SimActuator {
    fn read_adc(&mut self, channel: u8) -> u16 {
        if channel == POT_CHANNEL {
            self.update();
            self.adc.round() as u16
        } else {
            self.aux.get(usize::from(channel)).copied().unwrap_or(0)
        }
    }

    fn set_motor_pwm(&mut self, drive: Drive) {
        self.update();
        self.pwm_writes += 1;
        self.drive = drive;
    }
}
