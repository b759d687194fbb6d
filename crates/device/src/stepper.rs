use core::task::Poll;

use rotoplot_protocol::{AxisState, AxisStatus};

use crate::hal::StepperDriver;

/// How often we ask the driver whether it has arrived.
pub const POLL_INTERVAL_MS: u32 = 5;

pub const ROTATE_TIMEOUT_MS: u64 = 30_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepperState {
    Idle,
    Moving { started_ms: u64 },
    PositionReached,
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepperTimeout;

/// Waits for the stepper driver to reach its target, giving up after a
/// timeout. There are no retries here: a timeout is reported and the
/// caller decides what to do about it.
pub struct StepperController<S> {
    driver: S,
    state: StepperState,
    target: i32,
    timeout_ms: u64,
}

impl<S: StepperDriver> StepperController<S> {
    pub fn new(mut driver: S) -> Self {
        let target = driver.current_position();
        Self {
            driver,
            state: StepperState::Idle,
            target,
            timeout_ms: ROTATE_TIMEOUT_MS,
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn begin(&mut self, target: i32, now_ms: u64) {
        self.target = target;
        self.driver.set_step_target(target);
        self.state = StepperState::Moving { started_ms: now_ms };
    }

    pub fn tick(&mut self, now_ms: u64) -> Poll<Result<(), StepperTimeout>> {
        match self.state {
            StepperState::Moving { started_ms } => {
                if self.driver.position_reached() {
                    self.state = StepperState::PositionReached;
                    Poll::Ready(Ok(()))
                } else if now_ms.saturating_sub(started_ms) >= self.timeout_ms {
                    self.driver.stop();
                    self.state = StepperState::TimedOut;
                    Poll::Ready(Err(StepperTimeout))
                } else {
                    Poll::Pending
                }
            }
            StepperState::TimedOut => Poll::Ready(Err(StepperTimeout)),
            StepperState::Idle | StepperState::PositionReached => Poll::Ready(Ok(())),
        }
    }

    pub fn stop(&mut self) {
        self.driver.stop();
        self.target = self.driver.current_position();
        self.state = StepperState::Idle;
    }

    pub fn position(&mut self) -> i32 {
        self.driver.current_position()
    }

    pub fn state(&self) -> StepperState {
        self.state
    }

    pub fn status(&mut self) -> AxisStatus {
        AxisStatus {
            position: self.position(),
            target: self.target,
            state: match self.state {
                StepperState::Idle => AxisState::Idle,
                StepperState::Moving { .. } => AxisState::Moving,
                StepperState::PositionReached => AxisState::Reached,
                StepperState::TimedOut => AxisState::TimedOut,
            },
        }
    }

    pub fn driver(&self) -> &S {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut S {
        &mut self.driver
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockStepper {
        position: i32,
        target: i32,
        // How many polls before the driver says it has arrived.
        polls_left: Option<u32>,
        stopped: bool,
    }

    impl StepperDriver for MockStepper {
        fn set_step_target(&mut self, steps: i32) {
            self.target = steps;
        }

        fn position_reached(&mut self) -> bool {
            match &mut self.polls_left {
                Some(0) => {
                    self.position = self.target;
                    true
                }
                Some(n) => {
                    *n -= 1;
                    false
                }
                None => false,
            }
        }

        fn current_position(&mut self) -> i32 {
            self.position
        }

        fn stop(&mut self) {
            self.stopped = true;
        }
    }

    #[test]
    fn reaches_target() {
        let mut ctrl = StepperController::new(MockStepper {
            polls_left: Some(2),
            ..Default::default()
        });
        ctrl.begin(500, 0);
        assert_eq!(ctrl.tick(0), Poll::Pending);
        assert_eq!(ctrl.tick(5), Poll::Pending);
        assert_eq!(ctrl.tick(10), Poll::Ready(Ok(())));
        assert_eq!(ctrl.state(), StepperState::PositionReached);
        assert_eq!(ctrl.position(), 500);
        assert!(!ctrl.driver().stopped);
    }

    #[test]
    fn times_out_and_stops() {
        let mut ctrl = StepperController::new(MockStepper::default()).with_timeout(100);
        ctrl.begin(500, 1000);
        assert_eq!(ctrl.tick(1099), Poll::Pending);
        assert_eq!(ctrl.tick(1100), Poll::Ready(Err(StepperTimeout)));
        assert_eq!(ctrl.state(), StepperState::TimedOut);
        assert!(ctrl.driver().stopped);

        let status = ctrl.status();
        assert_eq!(status.target, 500);
        assert_eq!(status.state, AxisState::TimedOut);
    }
}
