//! Closed-loop position control for the linear actuator.
//!
//! This is a bang-bang controller with the duty cycle shaped by the
//! distance to the target: full power when far away, and less power close
//! in so that the actuator doesn't coast through the tolerance band.

use core::task::Poll;

use rotoplot_protocol::{AxisState, AxisStatus, DeviceError};

use crate::hal::{Drive, LinearDriver};

/// Convergence tolerance, in ADC counts.
pub const TOLERANCE: u16 = 7;

/// The looser tolerance used while homing.
pub const HOME_TOLERANCE: u16 = 15;

pub const LINEAR_TIMEOUT_MS: u64 = 20_000;

/// Picks the duty cycle for a given distance (in ADC counts) from the
/// target.
pub fn duty_for_error(distance: u32) -> u8 {
    if distance > 50 {
        100
    } else if distance >= 20 {
        50
    } else {
        25
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinearState {
    Idle,
    Seeking { tolerance: u16, started_ms: u64 },
    Converged,
    TimedOut { adc: u16 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinearTimeout {
    pub adc: u16,
}

pub struct LinearController<L> {
    driver: L,
    adc_min: u16,
    adc_max: u16,
    state: LinearState,
    target: u16,
    timeout_ms: u64,
}

impl<L: LinearDriver> LinearController<L> {
    pub fn new(driver: L, adc_min: u16, adc_max: u16) -> Self {
        Self {
            driver,
            adc_min,
            adc_max,
            state: LinearState::Idle,
            target: adc_min,
            timeout_ms: LINEAR_TIMEOUT_MS,
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Starts seeking `target`. Targets outside the calibrated range are
    /// rejected without touching the motor.
    pub fn begin(&mut self, target: i32, tolerance: u16, now_ms: u64) -> Result<(), DeviceError> {
        let out_of_range = DeviceError::OutOfRange {
            target,
            min: self.adc_min,
            max: self.adc_max,
        };
        let target = u16::try_from(target).map_err(|_| out_of_range)?;
        if target < self.adc_min || target > self.adc_max {
            return Err(out_of_range);
        }

        self.target = target;
        self.state = LinearState::Seeking {
            tolerance,
            started_ms: now_ms,
        };
        Ok(())
    }

    /// Runs one control step.
    pub fn tick(&mut self, now_ms: u64) -> Poll<Result<(), LinearTimeout>> {
        let (tolerance, started_ms) = match self.state {
            LinearState::Seeking {
                tolerance,
                started_ms,
            } => (tolerance, started_ms),
            LinearState::TimedOut { adc } => return Poll::Ready(Err(LinearTimeout { adc })),
            LinearState::Idle | LinearState::Converged => return Poll::Ready(Ok(())),
        };

        let adc = self.driver.read_potentiometer();
        let error = i32::from(self.target) - i32::from(adc);
        let distance = error.unsigned_abs();

        if distance < u32::from(tolerance) {
            self.driver.set_motor_pwm(Drive::Stop);
            self.state = LinearState::Converged;
            return Poll::Ready(Ok(()));
        }

        if now_ms.saturating_sub(started_ms) >= self.timeout_ms {
            self.driver.set_motor_pwm(Drive::Stop);
            self.state = LinearState::TimedOut { adc };
            return Poll::Ready(Err(LinearTimeout { adc }));
        }

        let duty = duty_for_error(distance);
        let drive = if error > 0 {
            Drive::Extend(duty)
        } else {
            Drive::Retract(duty)
        };
        self.driver.set_motor_pwm(drive);
        Poll::Pending
    }

    /// Drives the motor open-loop, abandoning any seek in progress.
    pub fn drive_raw(&mut self, drive: Drive) {
        self.state = LinearState::Idle;
        self.driver.set_motor_pwm(drive);
    }

    pub fn stop(&mut self) {
        self.drive_raw(Drive::Stop);
    }

    pub fn position(&mut self) -> u16 {
        self.driver.read_potentiometer()
    }

    pub fn read_adc(&mut self, channel: u8) -> u16 {
        self.driver.read_adc(channel)
    }

    pub fn state(&self) -> LinearState {
        self.state
    }

    pub fn status(&mut self) -> AxisStatus {
        AxisStatus {
            position: i32::from(self.position()),
            target: i32::from(self.target),
            state: match self.state {
                LinearState::Idle => AxisState::Idle,
                LinearState::Seeking { .. } => AxisState::Moving,
                LinearState::Converged => AxisState::Reached,
                LinearState::TimedOut { .. } => AxisState::TimedOut,
            },
        }
    }

    pub fn driver(&self) -> &L {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut L {
        &mut self.driver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // An actuator that reports whatever we tell it to, and remembers what
    // it was asked to do.
    #[derive(Default)]
    struct ScriptedActuator {
        adc: u16,
        drives: Vec<Drive>,
    }

    impl LinearDriver for ScriptedActuator {
        fn read_adc(&mut self, _channel: u8) -> u16 {
            self.adc
        }

        fn set_motor_pwm(&mut self, drive: Drive) {
            self.drives.push(drive);
        }
    }

    fn controller(adc: u16) -> LinearController<ScriptedActuator> {
        LinearController::new(
            ScriptedActuator {
                adc,
                drives: Vec::new(),
            },
            0,
            834,
        )
    }

    #[test]
    fn duty_zones() {
        assert_eq!(duty_for_error(400), 100);
        assert_eq!(duty_for_error(51), 100);
        assert_eq!(duty_for_error(50), 50);
        assert_eq!(duty_for_error(20), 50);
        assert_eq!(duty_for_error(19), 25);
        assert_eq!(duty_for_error(7), 25);
    }

    #[test]
    fn drives_towards_target() {
        let mut ctrl = controller(100);
        ctrl.begin(400, TOLERANCE, 0).unwrap();
        assert_eq!(ctrl.tick(0), Poll::Pending);

        ctrl.driver_mut().adc = 370;
        assert_eq!(ctrl.tick(5), Poll::Pending);

        ctrl.driver_mut().adc = 390;
        assert_eq!(ctrl.tick(10), Poll::Pending);

        ctrl.driver_mut().adc = 410;
        assert_eq!(ctrl.tick(15), Poll::Pending);

        ctrl.driver_mut().adc = 394;
        assert_eq!(ctrl.tick(20), Poll::Ready(Ok(())));

        assert_eq!(
            ctrl.driver().drives,
            vec![
                Drive::Extend(100),
                Drive::Extend(50),
                Drive::Extend(25),
                Drive::Retract(25),
                Drive::Stop
            ]
        );
        assert_eq!(ctrl.state(), LinearState::Converged);
    }

    #[test]
    fn tolerance_is_exclusive() {
        let mut ctrl = controller(393);
        ctrl.begin(400, TOLERANCE, 0).unwrap();
        assert_eq!(ctrl.tick(0), Poll::Pending);

        let mut ctrl = controller(386);
        ctrl.begin(400, HOME_TOLERANCE, 0).unwrap();
        assert_eq!(ctrl.tick(0), Poll::Ready(Ok(())));
    }

    #[test]
    fn times_out_with_motor_stopped() {
        let mut ctrl = controller(100).with_timeout(50);
        ctrl.begin(400, TOLERANCE, 0).unwrap();
        for t in (0..50).step_by(5) {
            assert_eq!(ctrl.tick(t), Poll::Pending);
        }
        assert_eq!(ctrl.tick(50), Poll::Ready(Err(LinearTimeout { adc: 100 })));
        assert_eq!(ctrl.driver().drives.last(), Some(&Drive::Stop));
        assert_eq!(ctrl.state(), LinearState::TimedOut { adc: 100 });
    }

    proptest! {
        // Out-of-range targets never reach the motor.
        #[test]
        fn test_out_of_range_never_drives(target in prop_oneof![i32::MIN..0, 835..i32::MAX]) {
            let mut ctrl = controller(300);
            let err = ctrl.begin(target, TOLERANCE, 0).unwrap_err();
            assert_eq!(err, DeviceError::OutOfRange { target, min: 0, max: 834 });
            assert_eq!(ctrl.tick(5), Poll::Ready(Ok(())));
            assert!(ctrl.driver().drives.is_empty());
        }
    }
}
