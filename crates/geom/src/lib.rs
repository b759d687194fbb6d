//! Basic geometry of the rotoplot, including conversion from Cartesian
//! coordinates to arm angle and extension, and from there to raw hardware
//! units (stepper microsteps and actuator ADC counts).
//!
//! The origin is the rotation axis of the arm. The positive y axis points
//! "up" the board, and an arm angle of zero points along it. Positive angles
//! sweep towards positive x.
//!
//! The arm has a fixed part (the pen offset) and a linear actuator that
//! extends it. The actuator reports its extension through a potentiometer,
//! read as an ADC value, so the radius is controlled in ADC units and the
//! angle in stepper microsteps.
//!
//! This crate supports `no_std` and uses `libm`, so that the firmware can
//! share the position types.

#![cfg_attr(not(feature = "std"), no_std)]

use core::fmt;

use libm::{atan2, cos, fabs, round, sin, sqrt};

pub type Angle = euclid::Angle<f64>;
pub type Point = euclid::Point2D<f64, Mm>;

pub struct Mm;

pub type Len = euclid::Length<f64, Mm>;

fn square(x: f64) -> f64 {
    x * x
}

pub trait LenExt {
    fn mm(self) -> Len;
}

impl LenExt for f64 {
    fn mm(self) -> Len {
        Len::new(self)
    }
}

pub trait FromKurbo {
    type Input;
    fn from_kurbo(p: Self::Input) -> Self;
}

#[cfg(feature = "kurbo")]
impl FromKurbo for Point {
    type Input = kurbo::Point;
    fn from_kurbo(p: kurbo::Point) -> Self {
        Point::new(p.x, p.y)
    }
}

#[cfg(feature = "kurbo")]
pub fn to_kurbo(p: Point) -> kurbo::Point {
    kurbo::Point::new(p.x, p.y)
}

/// The position of the plotter in raw hardware units.
///
/// This is what the firmware reports in response to `GET_POS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Position {
    /// Stepper position, in microsteps. Zero points the arm up the board.
    pub angle_steps: i32,
    /// Linear actuator potentiometer reading.
    pub linear_adc: u16,
}

/// Calibration constants for one physical plotter.
///
/// These are measured once (by driving the actuator to its end stops and
/// reading the potentiometer) and then stay fixed for a session.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Calibration {
    /// ADC reading when the actuator is fully retracted.
    pub adc_min: u16,
    /// ADC reading when the actuator is fully extended.
    pub adc_max: u16,
    /// ADC reading of the home position.
    pub adc_home: u16,
    /// Stepper position of the home position.
    pub home_steps: i32,
    /// The largest stepper position (in absolute value) that the arm may
    /// be sent to.
    pub max_steps: i32,
    /// Distance from the rotation axis to the pen when the actuator is
    /// fully retracted.
    pub pen_offset_mm: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration {
            adc_min: 0,
            adc_max: 834,
            adc_home: 10,
            home_steps: 0,
            // 45 degrees either side of vertical.
            max_steps: 128_000,
            pen_offset_mm: 160.0,
        }
    }
}

impl Calibration {
    pub fn validate(&self) -> Result<(), GeomError> {
        let ok = self.adc_min < self.adc_home
            && self.adc_home <= self.adc_max
            && self.max_steps > 0
            && self.home_steps.abs() <= self.max_steps
            && self.pen_offset_mm.is_finite()
            && self.pen_offset_mm >= 0.0;
        if ok {
            Ok(())
        } else {
            Err(GeomError::InvalidCalibration)
        }
    }

    pub fn adc_span(&self) -> f64 {
        f64::from(self.adc_max) - f64::from(self.adc_min)
    }
}

/// Why a point can't be drawn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Violation {
    /// The point is off the drawing board.
    OutsideBoard,
    /// The arm can't be made this long (or this short).
    Reach { radius_mm: f64 },
    /// The arm can't rotate this far.
    Angle { steps: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeomError {
    InvalidCalibration,
    OutOfWorkspace(Violation),
}

impl fmt::Display for GeomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeomError::InvalidCalibration => {
                f.write_str("invalid calibration: need adc_min < adc_home <= adc_max")
            }
            GeomError::OutOfWorkspace(Violation::OutsideBoard) => {
                f.write_str("out of workspace: point is off the board")
            }
            GeomError::OutOfWorkspace(Violation::Reach { radius_mm }) => {
                write!(f, "out of workspace: radius {radius_mm:.1}mm is out of reach")
            }
            GeomError::OutOfWorkspace(Violation::Angle { steps }) => {
                write!(f, "out of workspace: rotation to {steps} steps is out of range")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for GeomError {}

/// The drawable rectangle of the board, in Cartesian coordinates.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Workspace {
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl Workspace {
    pub fn contains(&self, p: &Point) -> bool {
        fabs(p.x) <= self.max_x && self.min_y <= p.y && p.y <= self.max_y
    }
}

pub struct ConfigBuilder {
    calibration: Calibration,
    steps_per_revolution: f64,
    linear_travel: Len,
    board_width: Len,
    board_height: Len,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            calibration: Calibration::default(),
            // 200 full steps, 256 microsteps, and a 20:1 gearbox.
            steps_per_revolution: 1_024_000.0,
            linear_travel: 300.0.mm(),
            board_width: 280.0.mm(),
            board_height: 350.0.mm(),
        }
    }
}

impl ConfigBuilder {
    pub fn build(&self) -> Config {
        Config {
            calibration: self.calibration,
            steps_per_revolution: self.steps_per_revolution,
            linear_travel: self.linear_travel,
            board_width: self.board_width,
            board_height: self.board_height,
        }
    }

    pub fn with_calibration(&mut self, calibration: Calibration) -> &mut Self {
        self.calibration = calibration;
        self
    }

    pub fn with_steps_per_revolution(&mut self, steps: f64) -> &mut Self {
        self.steps_per_revolution = steps;
        self
    }

    pub fn with_linear_travel(&mut self, travel: Len) -> &mut Self {
        self.linear_travel = travel;
        self
    }

    pub fn with_board_size(&mut self, width: Len, height: Len) -> &mut Self {
        self.board_width = width;
        self.board_height = height;
        self
    }
}

/// The geometric configuration of a rotoplot.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Config {
    pub calibration: Calibration,
    /// How many microsteps does it take for the arm to make one revolution?
    pub steps_per_revolution: f64,
    /// The physical travel of the linear actuator, from fully retracted
    /// (`adc_min`) to fully extended (`adc_max`).
    pub linear_travel: Len,
    /// The board is centered on the y axis, and starts at the pen's
    /// fully-retracted position.
    pub board_width: Len,
    pub board_height: Len,
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::default().build()
    }
}

impl Config {
    pub fn workspace(&self) -> Workspace {
        let min_y = self.calibration.pen_offset_mm;
        Workspace {
            max_x: self.board_width.get() / 2.0,
            min_y,
            max_y: min_y + self.board_height.get(),
        }
    }

    pub fn min_radius(&self) -> Len {
        self.calibration.pen_offset_mm.mm()
    }

    pub fn max_radius(&self) -> Len {
        self.min_radius() + self.linear_travel
    }

    pub fn adc_per_mm(&self) -> f64 {
        self.calibration.adc_span() / self.linear_travel.get()
    }

    pub fn steps_per_degree(&self) -> f64 {
        self.steps_per_revolution / 360.0
    }

    /// The arm angle and radius that put the pen on `p`.
    pub fn polar(&self, p: &Point) -> (Angle, Len) {
        (
            Angle::radians(atan2(p.x, p.y)),
            sqrt(square(p.x) + square(p.y)).mm(),
        )
    }

    pub fn angle_to_steps(&self, angle: Angle) -> i32 {
        round(angle.to_degrees() * self.steps_per_degree()) as i32
    }

    pub fn steps_to_angle(&self, steps: i32) -> Angle {
        Angle::degrees(f64::from(steps) / self.steps_per_degree())
    }

    pub fn polar_to_hardware(&self, angle: Angle, radius: Len) -> Result<Position, GeomError> {
        let cal = &self.calibration;
        let angle_steps = self.angle_to_steps(angle);
        if angle_steps.abs() > cal.max_steps {
            return Err(GeomError::OutOfWorkspace(Violation::Angle {
                steps: angle_steps,
            }));
        }

        let extension = radius - self.min_radius();
        let adc = f64::from(cal.adc_min) + extension.get() * self.adc_per_mm();
        // Allow half a count of slack, so that points that round onto the
        // end stops are still reachable.
        if adc < f64::from(cal.adc_min) - 0.5 || adc > f64::from(cal.adc_max) + 0.5 {
            return Err(GeomError::OutOfWorkspace(Violation::Reach {
                radius_mm: radius.get(),
            }));
        }
        let linear_adc = round(adc).clamp(f64::from(cal.adc_min), f64::from(cal.adc_max)) as u16;

        Ok(Position {
            angle_steps,
            linear_adc,
        })
    }

    pub fn hardware_to_polar(&self, pos: &Position) -> (Angle, Len) {
        let cal = &self.calibration;
        let extension = (f64::from(pos.linear_adc) - f64::from(cal.adc_min)) / self.adc_per_mm();
        (
            self.steps_to_angle(pos.angle_steps),
            self.min_radius() + extension.mm(),
        )
    }

    pub fn point_to_hardware(&self, p: &Point) -> Result<Position, GeomError> {
        let (angle, radius) = self.polar(p);
        self.polar_to_hardware(angle, radius)
    }

    pub fn hardware_to_point(&self, pos: &Position) -> Point {
        let (angle, radius) = self.hardware_to_polar(pos);
        let theta = angle.get();
        Point::new(radius.get() * sin(theta), radius.get() * cos(theta))
    }

    /// Checks that `p` is on the board and within reach of the arm, and
    /// returns the hardware position for it.
    pub fn check_point(&self, p: &Point) -> Result<Position, GeomError> {
        if !self.workspace().contains(p) {
            return Err(GeomError::OutOfWorkspace(Violation::OutsideBoard));
        }
        self.point_to_hardware(p)
    }

    /// The hardware position of the home position.
    pub fn home_position(&self) -> Position {
        Position {
            angle_steps: self.calibration.home_steps,
            linear_adc: self.calibration.adc_home,
        }
    }
}
