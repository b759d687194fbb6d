//! The primitives that the board's peripheral drivers provide.

/// The ADC channel wired to the linear actuator's potentiometer.
pub const POT_CHANNEL: u8 = 0;

/// How many ADC channels `DEBUG_ADC` reports.
pub const ADC_CHANNELS: u8 = 4;

/// A stepper driver with its own motion controller: we give it a target
/// and it tells us when it gets there.
pub trait StepperDriver {
    fn set_step_target(&mut self, steps: i32);
    fn position_reached(&mut self) -> bool;
    fn current_position(&mut self) -> i32;
    /// Stop moving, and hold the current position.
    fn stop(&mut self);
}

/// What to do with the linear actuator's motor. The duty cycle is in
/// percent.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Drive {
    Stop,
    Extend(u8),
    Retract(u8),
}

pub trait LinearDriver {
    fn read_adc(&mut self, channel: u8) -> u16;

    fn read_potentiometer(&mut self) -> u16 {
        self.read_adc(POT_CHANNEL)
    }

    fn set_motor_pwm(&mut self, drive: Drive);
}

pub trait Clock {
    fn now_ms(&self) -> u64;
    fn delay_ms(&mut self, ms: u32);
}

/// The serial link to the host. Responses are written through the
/// `core::fmt::Write` impl.
pub trait SerialPort: core::fmt::Write {
    /// Returns the next received byte, if one is available.
    fn read_byte(&mut self) -> Option<u8>;
}
