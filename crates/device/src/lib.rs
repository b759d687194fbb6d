//! The device side of the rotoplot: closed-loop control of the two axes,
//! and the command loop that drives them.
//!
//! Everything here is written against the small set of hardware traits in
//! [`hal`], so it runs unchanged on the board and (with the simulated parts
//! in [`sim`]) on the host. Waiting is done by explicit state machines that
//! are ticked against an injected [`Clock`](hal::Clock), never by sleeping
//! in place.

#![cfg_attr(not(feature = "std"), no_std)]

use core::task::Poll;

use rotoplot_geom::Calibration;
use rotoplot_protocol::{Cmd, DeviceError, ParseError, Payload, Position, Response, Status};

pub mod hal;
pub mod line;
pub mod linear;
#[cfg(feature = "std")]
pub mod sim;
pub mod stepper;

use hal::{Clock, Drive, LinearDriver, SerialPort, StepperDriver, ADC_CHANNELS};
use line::{Garbled, LineBuffer};
use linear::{LinearController, LinearTimeout, HOME_TOLERANCE, TOLERANCE};
use stepper::{StepperController, StepperTimeout, POLL_INTERVAL_MS};

/// The plotter firmware: one stepper, one linear actuator, and a serial
/// port that they are commanded over.
///
/// Commands are handled one at a time, and each one runs to completion
/// (or to its timeout) before the next line is read.
pub struct Device<S, L, C> {
    stepper: StepperController<S>,
    linear: LinearController<L>,
    clock: C,
    calibration: Calibration,
    line: LineBuffer,
}

impl<S: StepperDriver, L: LinearDriver, C: Clock> Device<S, L, C> {
    pub fn new(stepper: S, linear: L, clock: C, calibration: Calibration) -> Self {
        Self {
            stepper: StepperController::new(stepper),
            linear: LinearController::new(linear, calibration.adc_min, calibration.adc_max),
            clock,
            calibration,
            line: LineBuffer::new(),
        }
    }

    /// Replaces the controllers' timeouts. Mostly useful for tests.
    pub fn with_timeouts(mut self, rotate_ms: u64, linear_ms: u64) -> Self {
        self.stepper = self.stepper.with_timeout(rotate_ms);
        self.linear = self.linear.with_timeout(linear_ms);
        self
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn stepper(&self) -> &S {
        self.stepper.driver()
    }

    pub fn stepper_mut(&mut self) -> &mut S {
        self.stepper.driver_mut()
    }

    pub fn actuator(&self) -> &L {
        self.linear.driver()
    }

    pub fn actuator_mut(&mut self) -> &mut L {
        self.linear.driver_mut()
    }

    /// Reads whatever is waiting on the serial port, and answers every
    /// complete line.
    pub fn poll<P: SerialPort>(&mut self, port: &mut P) -> core::fmt::Result {
        while let Some(byte) = port.read_byte() {
            let resp = match self.line.push(byte) {
                None => continue,
                Some(Ok(line)) => match self.handle_line(&line) {
                    Some(resp) => resp,
                    None => continue,
                },
                Some(Err(Garbled)) => {
                    log::warn!("dropping garbled line");
                    DeviceError::UnknownCommand.into()
                }
            };
            write!(port, "{resp}")?;
        }
        Ok(())
    }

    /// Parses and executes one command line. Blank lines get no response.
    pub fn handle_line(&mut self, line: &str) -> Option<Response> {
        match Cmd::parse(line) {
            Ok(cmd) => Some(self.execute(cmd)),
            Err(ParseError::Empty) => None,
            Err(e) => {
                log::debug!("bad command {line:?}: {e:?}");
                Some(Response::Error(e.into()))
            }
        }
    }

    pub fn execute(&mut self, cmd: Cmd) -> Response {
        log::debug!("executing {cmd}");
        match self.dispatch(cmd) {
            Ok(payload) => Response::Ok(payload),
            Err(e) => {
                if e.is_timeout() {
                    log::warn!("{cmd}: {e}");
                }
                Response::Error(e)
            }
        }
    }

    fn dispatch(&mut self, cmd: Cmd) -> Result<Option<Payload>, DeviceError> {
        match cmd {
            Cmd::Home => self.home()?,
            Cmd::Rotate(steps) => self
                .rotate(steps)
                .map_err(|StepperTimeout| DeviceError::RotateTimeout)?,
            Cmd::Linear(target) => {
                self.linear.begin(target, TOLERANCE, self.clock.now_ms())?;
                self.wait_linear()
                    .map_err(|LinearTimeout { adc }| DeviceError::LinearTimeout { adc })?;
            }
            Cmd::Stop => {
                self.stepper.stop();
                self.linear.stop();
            }
            Cmd::StopLinear => self.linear.stop(),
            Cmd::ExtendRaw => self.linear.drive_raw(Drive::Extend(100)),
            Cmd::RetractRaw => self.linear.drive_raw(Drive::Retract(100)),
            Cmd::GetPos => {
                return Ok(Some(Payload::Position(self.position())));
            }
            Cmd::Status => {
                return Ok(Some(Payload::Status(self.status())));
            }
            Cmd::DebugAdc => {
                let mut adc = [0u16; ADC_CHANNELS as usize];
                for (ch, slot) in (0..ADC_CHANNELS).zip(&mut adc) {
                    *slot = self.linear.read_adc(ch);
                }
                return Ok(Some(Payload::Adc(adc)));
            }
        }
        Ok(None)
    }

    pub fn position(&mut self) -> Position {
        Position {
            angle_steps: self.stepper.position(),
            linear_adc: self.linear.position(),
        }
    }

    pub fn status(&mut self) -> Status {
        let cal = &self.calibration;
        let (adc_min, adc_max, adc_home, home_steps) =
            (cal.adc_min, cal.adc_max, cal.adc_home, cal.home_steps);
        Status {
            stepper: self.stepper.status(),
            linear: self.linear.status(),
            adc_min,
            adc_max,
            adc_home,
            home_steps,
        }
    }

    fn rotate(&mut self, steps: i32) -> Result<(), StepperTimeout> {
        self.stepper.begin(steps, self.clock.now_ms());
        self.wait_stepper()
    }

    fn home(&mut self) -> Result<(), DeviceError> {
        let cal = self.calibration;
        self.rotate(cal.home_steps)
            .map_err(|StepperTimeout| DeviceError::HomeRotateTimeout)?;
        self.linear
            .begin(i32::from(cal.adc_home), HOME_TOLERANCE, self.clock.now_ms())?;
        self.wait_linear()
            .map_err(|LinearTimeout { adc }| DeviceError::HomeLinearTimeout { adc })
    }

    fn wait_stepper(&mut self) -> Result<(), StepperTimeout> {
        loop {
            if let Poll::Ready(res) = self.stepper.tick(self.clock.now_ms()) {
                return res;
            }
            self.clock.delay_ms(POLL_INTERVAL_MS);
        }
    }

    fn wait_linear(&mut self) -> Result<(), LinearTimeout> {
        loop {
            if let Poll::Ready(res) = self.linear.tick(self.clock.now_ms()) {
                return res;
            }
            self.clock.delay_ms(POLL_INTERVAL_MS);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use proptest::prelude::*;
    use rotoplot_protocol::AxisState;

    use super::*;
    use sim::{SimActuator, SimClock, SimStepper};

    type SimDevice = Device<SimStepper, SimActuator, SimClock>;

    fn device_with(stepper: SimStepper, actuator: SimActuator, clock: SimClock) -> SimDevice {
        Device::new(stepper, actuator, clock, Calibration::default())
    }

    fn device() -> SimDevice {
        let clock = SimClock::new();
        device_with(
            SimStepper::new(clock.clone(), 0),
            SimActuator::new(clock.clone(), 0, 834, 417),
            clock,
        )
    }

    fn run(dev: &mut SimDevice, line: &str) -> String {
        dev.handle_line(line)
            .map(|r| r.to_string())
            .unwrap_or_default()
    }

    #[test]
    fn rotate_then_get_pos() {
        let mut dev = device();
        assert_eq!(run(&mut dev, "ROTATE 1200"), "OK\n");
        assert_eq!(run(&mut dev, "get_pos"), "OK 1200 417\n");
        assert_eq!(dev.stepper.state(), stepper::StepperState::PositionReached);
    }

    #[test]
    fn linear_converges() {
        let mut dev = device();
        assert_eq!(run(&mut dev, "LINEAR 600"), "OK\n");
        let adc = dev.position().linear_adc;
        assert!(adc.abs_diff(600) < TOLERANCE, "adc {adc}");
        assert_eq!(dev.actuator().drive(), Drive::Stop);

        assert_eq!(run(&mut dev, "LINEAR 100"), "OK\n");
        let adc = dev.position().linear_adc;
        assert!(adc.abs_diff(100) < TOLERANCE, "adc {adc}");
    }

    #[test]
    fn stalled_linear_times_out_at_twenty_seconds() {
        let clock = SimClock::new();
        let mut dev = device_with(
            SimStepper::new(clock.clone(), 0),
            SimActuator::new(clock.clone(), 0, 834, 300).stalled(),
            clock,
        );
        assert_eq!(
            run(&mut dev, "LINEAR 700"),
            "ERROR: LINEAR timeout at ADC 300\n"
        );
        assert_eq!(dev.clock().now_ms(), 20_000);
        assert_eq!(dev.actuator().drive(), Drive::Stop);
        assert_eq!(dev.status().linear.state, AxisState::TimedOut);
    }

    #[test]
    fn stalled_stepper_times_out() {
        let clock = SimClock::new();
        let mut dev = device_with(
            SimStepper::new(clock.clone(), 5000).stalled(),
            SimActuator::new(clock.clone(), 0, 834, 10),
            clock,
        );
        assert_eq!(
            run(&mut dev, "ROTATE 6000"),
            "ERROR: ROTATE timeout - position not reached\n"
        );
        assert_eq!(dev.clock().now_ms(), 30_000);

        // HOME gives up on the stepper too, rather than waiting forever.
        assert_eq!(
            run(&mut dev, "HOME"),
            "ERROR: HOME rotate timeout - position not reached\n"
        );
    }

    #[test]
    fn home_is_idempotent() {
        let mut dev = device();
        run(&mut dev, "ROTATE -20000");
        run(&mut dev, "LINEAR 700");

        assert_eq!(run(&mut dev, "HOME"), "OK\n");
        let first = dev.position();
        assert_eq!(first.angle_steps, 0);
        assert!(first.linear_adc.abs_diff(10) < HOME_TOLERANCE);

        let writes = dev.actuator().pwm_writes;
        assert_eq!(run(&mut dev, "HOME"), "OK\n");
        assert_eq!(dev.position(), first);
        // Already in tolerance, so the only write is the final stop.
        assert_eq!(dev.actuator().pwm_writes, writes + 1);
    }

    #[test]
    fn protocol_errors() {
        let mut dev = device();
        assert_eq!(run(&mut dev, "FLY"), "ERROR: Unknown command\n");
        assert_eq!(
            run(&mut dev, "ROTATE"),
            "ERROR: ROTATE requires steps parameter\n"
        );
        assert_eq!(
            run(&mut dev, "linear"),
            "ERROR: LINEAR requires target parameter\n"
        );
        assert_eq!(dev.handle_line("   "), None);
    }

    #[test]
    fn raw_moves() {
        let mut dev = device();
        assert_eq!(run(&mut dev, "EXTEND_RAW"), "OK\n");
        dev.clock().advance(1000);
        assert_eq!(dev.position().linear_adc, 567);

        assert_eq!(run(&mut dev, "STOP_LINEAR"), "OK\n");
        dev.clock().advance(1000);
        assert_eq!(dev.position().linear_adc, 567);

        assert_eq!(run(&mut dev, "RETRACT_RAW"), "OK\n");
        dev.clock().advance(1000);
        assert_eq!(run(&mut dev, "STOP"), "OK\n");
        assert_eq!(dev.position().linear_adc, 417);
        assert_eq!(dev.status().linear.state, AxisState::Idle);
    }

    #[test]
    fn status_and_adc() {
        let mut dev = device();
        dev.actuator_mut().aux = [0, 11, 22, 33];
        assert_eq!(run(&mut dev, "DEBUG_ADC"), "OK 417 11 22 33\n");

        run(&mut dev, "ROTATE 300");
        assert_eq!(
            run(&mut dev, "STATUS"),
            "STEPPER 300 300 REACHED\nLINEAR 417 0 IDLE\nCALIB 0 834 10 0\nOK\n"
        );
    }

    #[derive(Default)]
    struct FakePort {
        input: VecDeque<u8>,
        output: String,
    }

    impl core::fmt::Write for FakePort {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            self.output.push_str(s);
            Ok(())
        }
    }

    impl SerialPort for FakePort {
        fn read_byte(&mut self) -> Option<u8> {
            self.input.pop_front()
        }
    }

    #[test]
    fn poll_serial() {
        let mut dev = device();
        let long = "X".repeat(100);
        let mut port = FakePort {
            input: format!("GET_POS\r\n\r\n{long}\nROTATE 5\n").into_bytes().into(),
            ..Default::default()
        };
        dev.poll(&mut port).unwrap();
        assert_eq!(
            port.output,
            "OK 0 417\nERROR: Unknown command\nOK\n"
        );
    }

    proptest! {
        // A rejected LINEAR never touches the motor.
        #[test]
        fn test_out_of_range_linear(target in prop_oneof![-100_000i32..0, 835..100_000i32]) {
            let mut dev = device();
            let resp = run(&mut dev, &format!("LINEAR {target}"));
            assert_eq!(resp, format!("ERROR: Target {target} out of range [0, 834]\n"));
            assert_eq!(dev.actuator().pwm_writes, 0);
            assert_eq!(dev.clock().now_ms(), 0);
        }
    }
}
