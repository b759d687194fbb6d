//! Records of what was drawn: the planned points, a line for every point as
//! it is reached, and a summary of each run.
//!
//! Every run gets its own directory, named after the time it started.

use std::{
    cell::Cell,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use chrono::Local;
use serde::Serialize;

use crate::executor::{ExecutionStats, PlannedPoint, Progress};

pub struct RunLog {
    dir: PathBuf,
    runs: Cell<u32>,
}

impl RunLog {
    pub fn create(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        Ok(RunLog {
            dir: dir.to_owned(),
            runs: Cell::new(0),
        })
    }

    pub fn start_run(&self) -> anyhow::Result<RunDir> {
        let seq = self.runs.get();
        self.runs.set(seq + 1);
        let name = format!("run_{}_{seq:03}", Local::now().format("%Y%m%d_%H%M%S"));
        let dir = self.dir.join(name);
        std::fs::create_dir(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        log::info!("logging this run to {}", dir.display());
        Ok(RunDir { dir })
    }
}

/// The log directory of a single run.
pub struct RunDir {
    dir: PathBuf,
}

impl RunDir {
    fn file(&self, name: &str) -> anyhow::Result<File> {
        let path = self.dir.join(name);
        File::create(&path).with_context(|| format!("failed to create {}", path.display()))
    }

    pub fn write_plan(&self, plan: &[PlannedPoint]) -> anyhow::Result<()> {
        write_plan(self.file("planned_path.csv")?, plan)
    }

    pub fn execution_log(&self) -> anyhow::Result<ExecutionLog<File>> {
        Ok(ExecutionLog::new(self.file("execution_log.csv")?))
    }

    pub fn write_summary(&self, stats: &ExecutionStats) -> anyhow::Result<()> {
        write_summary(self.file("summary.json")?, stats)
    }
}

pub fn write_plan(out: impl Write, plan: &[PlannedPoint]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    for p in plan {
        writer.serialize(p)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_summary(mut out: impl Write, stats: &ExecutionStats) -> anyhow::Result<()> {
    serde_json::to_writer_pretty(&mut out, stats)?;
    writeln!(out)?;
    Ok(())
}

#[derive(Serialize)]
struct ExecutionRecord {
    index: usize,
    start_x: f64,
    start_y: f64,
    end_x: f64,
    end_y: f64,
    angle_steps: i32,
    linear_adc: u16,
    duration_secs: f64,
    timestamp: String,
}

/// One CSV row for every point that the plotter reached.
pub struct ExecutionLog<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> ExecutionLog<W> {
    pub fn new(out: W) -> Self {
        ExecutionLog {
            writer: csv::Writer::from_writer(out),
        }
    }

    pub fn record(&mut self, p: &Progress) -> anyhow::Result<()> {
        self.writer.serialize(ExecutionRecord {
            index: p.index,
            start_x: p.from.x,
            start_y: p.from.y,
            end_x: p.point.x,
            end_y: p.point.y,
            angle_steps: p.position.angle_steps,
            linear_adc: p.position.linear_adc,
            duration_secs: p.point_secs,
            timestamp: Local::now().to_rfc3339(),
        })?;
        // Flushed every time, so that the log is complete up to the last
        // point even if the run dies.
        self.writer.flush()?;
        Ok(())
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(|e| panic!("{e}"))
    }
}

#[cfg(test)]
mod tests {
    use rotoplot_geom::{Point, Position};
    use rotoplot_planner::PathStats;

    use super::*;
    use crate::executor::Outcome;

    #[test]
    fn plan_csv() {
        let plan = [
            PlannedPoint {
                index: 0,
                x: 0.0,
                y: 310.0,
                angle_steps: 0,
                linear_adc: 417,
            },
            PlannedPoint {
                index: 1,
                x: 1.5,
                y: 310.0,
                angle_steps: 789,
                linear_adc: 417,
            },
        ];
        let mut out = Vec::new();
        write_plan(&mut out, &plan).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "index,x,y,angle_steps,linear_adc\n0,0.0,310.0,0,417\n1,1.5,310.0,789,417\n"
        );
    }

    #[test]
    fn summary_json() {
        let stats = ExecutionStats {
            outcome: Outcome::Cancelled,
            total_points: 10,
            completed_points: 4,
            elapsed_secs: 1.5,
            avg_point_secs: Some(0.375),
            remaining_secs: Some(2.25),
            planned_length_mm: 9.0,
            path: PathStats::default(),
        };
        let mut out = Vec::new();
        write_summary(&mut out, &stats).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(json["outcome"], "cancelled");
        assert_eq!(json["completed_points"], 4);
        assert_eq!(json["remaining_secs"], 2.25);
        assert_eq!(json["path"]["bounds"], serde_json::Value::Null);
    }

    #[test]
    fn execution_csv() {
        let mut log = ExecutionLog::new(Vec::new());
        log.record(&Progress {
            index: 1,
            from: Point::new(0.0, 300.0),
            point: Point::new(0.5, 300.0),
            position: Position {
                angle_steps: 263,
                linear_adc: 390,
            },
            fraction: 0.5,
            point_secs: 0.25,
            elapsed_secs: 0.5,
            eta_secs: 0.25,
        })
        .unwrap();

        let text = String::from_utf8(log.into_inner()).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("index,start_x,start_y,end_x,end_y,angle_steps,linear_adc,duration_secs,timestamp")
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with("1,0.0,300.0,0.5,300.0,263,390,0.25,"), "{row}");
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn runs_get_their_own_directories() {
        let root = std::env::temp_dir().join(format!("rotoplot-runlog-{}", std::process::id()));
        let log = RunLog::create(&root).unwrap();
        let a = log.start_run().unwrap();
        let b = log.start_run().unwrap();
        assert_ne!(a.dir, b.dir);
        a.write_plan(&[]).unwrap();
        assert!(a.dir.join("planned_path.csv").exists());
        std::fs::remove_dir_all(&root).unwrap();
    }
}
