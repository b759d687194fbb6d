use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use rotoplot_geom::{Config, GeomError, Point, Position};
use rotoplot_planner::{interpolate, PathPoint, PathStats, PlanError};
use serde::Serialize;

use crate::connection::{Plotter, PlotterError, PlotterLink, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("point {index} ({x:.1}, {y:.1}) is unreachable: {reason}", x = .point.x, y = .point.y)]
    OutOfWorkspace {
        index: usize,
        point: Point,
        #[source]
        reason: GeomError,
    },
    #[error("actuator fault at point {index}: {message}")]
    ActuatorFault { index: usize, message: String },
    #[error("lost the plotter at point {index}")]
    Transport {
        index: usize,
        #[source]
        source: TransportError,
    },
}

impl ExecError {
    fn from_plotter(index: usize, e: PlotterError) -> Self {
        match e {
            PlotterError::Device { message, .. } => ExecError::ActuatorFault { index, message },
            PlotterError::Transport(source) => ExecError::Transport { index, source },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    Validating,
    Running,
    Completed,
    Aborted,
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Cancelled,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct ExecutionStats {
    pub outcome: Outcome,
    pub total_points: usize,
    pub completed_points: usize,
    pub elapsed_secs: f64,
    /// The average time spent on each completed point.
    pub avg_point_secs: Option<f64>,
    /// How much longer the points that weren't drawn would have taken, at
    /// the average rate.
    pub remaining_secs: Option<f64>,
    /// The length of the whole plan, in mm.
    pub planned_length_mm: f64,
    /// The part of the path that was actually drawn.
    pub path: PathStats,
}

/// The average time per point, and the time left for the remaining points.
fn estimate(elapsed_secs: f64, completed: usize, total: usize) -> (Option<f64>, Option<f64>) {
    if completed == 0 {
        return (None, None);
    }
    let avg = elapsed_secs / completed as f64;
    (Some(avg), Some(avg * total.saturating_sub(completed) as f64))
}

/// One point of a validated plan.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PlannedPoint {
    pub index: usize,
    pub x: f64,
    pub y: f64,
    pub angle_steps: i32,
    pub linear_adc: u16,
}

impl PlannedPoint {
    pub fn point(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn position(&self) -> Position {
        Position {
            angle_steps: self.angle_steps,
            linear_adc: self.linear_adc,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Progress {
    pub index: usize,
    /// Where the pen came from: the previous point of the plan.
    pub from: Point,
    pub point: Point,
    pub position: Position,
    /// How much of the path is done, between 0 and 1.
    pub fraction: f64,
    /// How long this point took.
    pub point_secs: f64,
    pub elapsed_secs: f64,
    /// The estimated time until the path is done.
    pub eta_secs: f64,
}

/// Asks a running path to stop. Cancellation takes effect between points,
/// and a cancel that arrives before a run starts stops that run before its
/// first point.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Checks for a cancel request, clearing it so that it only stops one
    /// run.
    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Drives the plotter along a path, one interpolated point at a time.
pub struct Executor<'a, L> {
    plotter: &'a Plotter<L>,
    config: Config,
    cancel: CancelHandle,
    state: ExecutionState,
}

impl<'a, L: PlotterLink> Executor<'a, L> {
    pub fn new(plotter: &'a Plotter<L>, config: Config) -> Self {
        Executor {
            plotter,
            config,
            cancel: CancelHandle::default(),
            state: ExecutionState::Idle,
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Interpolates the path and checks that every point is reachable.
    /// Nothing is sent to the plotter.
    pub fn plan(
        &mut self,
        path: &[PathPoint],
        step_mm: f64,
    ) -> Result<Vec<PlannedPoint>, ExecError> {
        self.state = ExecutionState::Validating;
        let plan = interpolate(path, step_mm)
            .map_err(ExecError::from)
            .and_then(|points| {
                points
                    .enumerate()
                    .map(|(index, point)| -> Result<PlannedPoint, ExecError> {
                        let pos = self.config.check_point(&point).map_err(|reason| {
                            ExecError::OutOfWorkspace {
                                index,
                                point,
                                reason,
                            }
                        })?;
                        Ok(PlannedPoint {
                            index,
                            x: point.x,
                            y: point.y,
                            angle_steps: pos.angle_steps,
                            linear_adc: pos.linear_adc,
                        })
                    })
                    .collect()
            });
        if plan.is_err() {
            self.state = ExecutionState::Aborted;
        }
        plan
    }

    /// Runs a plan. For each point, the arm is rotated first and then
    /// extended.
    pub fn run(
        &mut self,
        plan: &[PlannedPoint],
        mut progress: impl FnMut(Progress),
    ) -> Result<ExecutionStats, ExecError> {
        self.state = ExecutionState::Running;
        let start = Instant::now();
        let total = plan.len();
        let planned_length_mm = PathStats::of(plan.iter().map(PlannedPoint::point)).length_mm;
        let stats = |outcome, completed_points| {
            let elapsed_secs = start.elapsed().as_secs_f64();
            let (avg_point_secs, remaining_secs) = estimate(elapsed_secs, completed_points, total);
            ExecutionStats {
                outcome,
                total_points: total,
                completed_points,
                elapsed_secs,
                avg_point_secs,
                remaining_secs,
                planned_length_mm,
                path: PathStats::of(plan[..completed_points].iter().map(PlannedPoint::point)),
            }
        };

        for (i, p) in plan.iter().enumerate() {
            if self.cancel.take() {
                log::info!("cancelled after {i} of {total} points");
                if let Err(e) = self.plotter.stop() {
                    log::error!("failed to stop after cancelling: {e}");
                }
                self.state = ExecutionState::Cancelled;
                return Ok(stats(Outcome::Cancelled, i));
            }

            let point_start = Instant::now();
            let res = self
                .plotter
                .rotate(p.angle_steps)
                .and_then(|()| self.plotter.linear(p.linear_adc));
            if let Err(e) = res {
                self.state = ExecutionState::Aborted;
                return Err(ExecError::from_plotter(p.index, e));
            }

            let elapsed_secs = start.elapsed().as_secs_f64();
            let (_, eta) = estimate(elapsed_secs, i + 1, total);
            progress(Progress {
                index: p.index,
                from: plan[i.saturating_sub(1)].point(),
                point: p.point(),
                position: p.position(),
                fraction: (i + 1) as f64 / total as f64,
                point_secs: point_start.elapsed().as_secs_f64(),
                elapsed_secs,
                eta_secs: eta.unwrap_or(0.0),
            });
        }

        self.state = ExecutionState::Completed;
        Ok(stats(Outcome::Completed, total))
    }

    /// Plans and runs a path.
    pub fn execute_path(
        &mut self,
        path: &[PathPoint],
        step_mm: f64,
        progress: impl FnMut(Progress),
    ) -> Result<ExecutionStats, ExecError> {
        let plan = self.plan(path, step_mm)?;
        self.run(&plan, progress)
    }
}
