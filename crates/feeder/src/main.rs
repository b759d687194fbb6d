use std::{fs::File, path::PathBuf, time::Duration};

use anyhow::anyhow;
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use indicatif::{ProgressBar, ProgressStyle};
use reedline::{DefaultPrompt, DefaultPromptSegment, Prompt, Reedline};
use rotoplot_geom::{Angle, Config, LenExt as _, Point};
use rotoplot_planner::{shapes, PathPoint};

use crate::{
    connection::{Plotter, PlotterLink, SerialLink},
    executor::{Executor, Outcome},
    runlog::{RunDir, RunLog},
    settings::Settings,
    simulator::SimulatedLink,
};

mod connection;
mod executor;
mod runlog;
mod settings;
mod simulator;

const TICK: Duration = Duration::from_millis(50);

const HELP: &str = "\
commands:
  home                      rotate to home, then retract to home
  rotate <deg>              rotate the arm to an angle
  linear <mm>               extend the actuator to a length
  raw_rotate <steps>        rotate to a stepper position
  raw_linear <adc>          extend the actuator to an ADC reading
  pos                       show the current position
  stop                      stop both axes
  extend                    run the actuator outwards until `stop_linear`
  retract                   run the actuator inwards until `stop_linear`
  stop_linear               stop the actuator
  status                    show the device's status report
  adc                       show the raw ADC channels
  line <x0> <y0> <x1> <y1>  draw a line
  rect <cx> <cy> <w> <h> [deg]
                            draw a rectangle, optionally rotated
  circle <cx> <cy> <r>      draw a circle
  smooth <tension> <x0> <y0> <x1> <y1> [<x> <y> ...]
                            draw a smooth curve through the points, with
                            tension between 0 (loose) and 1 (straight)
  step <mm>                 set the interpolation step
  help                      show this message
  quit";

/// Drive a rotoplot over its serial port.
#[derive(Parser)]
struct Args {
    /// The serial port that the plotter is attached to.
    #[arg(long)]
    port: Option<String>,
    #[arg(long)]
    baud: Option<u32>,
    /// A JSON settings file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Don't connect to a plotter: simulate one, and draw what it did to
    /// this SVG file on exit.
    #[arg(long, value_name = "SVG")]
    simulate: Option<PathBuf>,
    /// Write a log of each drawn path into this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// The interpolation step, in mm.
    #[arg(long)]
    step: Option<f64>,
}

#[derive(Debug)]
enum Error {
    Exit,
    Err(anyhow::Error),
}

impl<E> From<E> for Error
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Error::Err(e.into())
    }
}

type Result<T> = std::result::Result<T, Error>;

fn read_cmd(reed: &mut Reedline, prompt: &dyn Prompt) -> Result<String> {
    let s = reed.read_line(prompt)?;
    match s {
        reedline::Signal::Success(s) => Ok(s),
        reedline::Signal::CtrlC | reedline::Signal::CtrlD => Err(Error::Exit),
    }
}

fn numbers(args: &[&str], min: usize, max: usize) -> anyhow::Result<Vec<f64>> {
    if args.len() < min || args.len() > max {
        return Err(if min == max {
            anyhow!("expected {min} arguments")
        } else if max == usize::MAX {
            anyhow!("expected at least {min} arguments")
        } else {
            anyhow!("expected {min} to {max} arguments")
        });
    }
    args.iter()
        .map(|a| {
            a.parse::<f64>()
                .map_err(|_| anyhow!("expected a number, not {a:?}"))
        })
        .collect()
}

fn integer(args: &[&str]) -> anyhow::Result<i32> {
    match args {
        [a] => a
            .parse()
            .map_err(|_| anyhow!("expected an integer, not {a:?}")),
        _ => Err(anyhow!("expected 1 argument")),
    }
}

/// Draws a path, letting the user cancel it with `q` or escape.
fn run_path<L: PlotterLink>(
    plotter: &Plotter<L>,
    settings: &Settings,
    path: &[PathPoint],
    runlog: Option<&RunLog>,
) -> anyhow::Result<()> {
    let mut exec = Executor::new(plotter, settings.geometry);
    let plan = exec.plan(path, settings.step_mm)?;
    let run = runlog.map(RunLog::start_run).transpose()?;
    if let Some(run) = &run {
        run.write_plan(&plan)?;
    }
    let mut exec_log = run.as_ref().map(RunDir::execution_log).transpose()?;

    let cancel = exec.cancel_handle();
    let len = plan.len() as u64;
    let bar = ProgressBar::new(len).with_style(ProgressStyle::with_template(
        "{bar:40} {pos}/{len} points, {elapsed}, {msg} (q to cancel)",
    )?);

    enable_raw_mode()?;
    let result = std::thread::scope(|s| -> anyhow::Result<_> {
        let worker = s.spawn(|| {
            exec.run(&plan, |p| {
                log::trace!("reached {:?} at {:?}", p.point, p.position);
                bar.set_position((p.fraction * len as f64).round() as u64);
                bar.set_message(format!("{:.0}s left", p.eta_secs));
                if let Some(out) = &mut exec_log {
                    if let Err(e) = out.record(&p) {
                        log::warn!("failed to log point {}: {e:#}", p.index);
                    }
                }
            })
        });

        while !worker.is_finished() {
            if !event::poll(TICK)? {
                continue;
            }
            if let Event::Key(key) = event::read()? {
                let quit = matches!(key.code, KeyCode::Char('q') | KeyCode::Esc);
                if key.kind == KeyEventKind::Press && quit {
                    cancel.cancel();
                }
            }
        }
        worker
            .join()
            .map_err(|_| anyhow!("the executor thread panicked"))
    });
    disable_raw_mode()?;
    bar.finish_and_clear();

    let stats = result??;
    if let Some(run) = &run {
        run.write_summary(&stats)?;
    }
    let verb = match stats.outcome {
        Outcome::Completed => "drew",
        Outcome::Cancelled => "cancelled after",
    };
    eprintln!(
        "{verb} {} of {} points ({:.1}mm) in {:.1}s",
        stats.completed_points, stats.total_points, stats.path.length_mm, stats.elapsed_secs
    );
    Ok(())
}

fn show_position<L: PlotterLink>(plotter: &Plotter<L>, config: &Config) -> anyhow::Result<()> {
    let pos = plotter.get_position()?;
    let p = config.hardware_to_point(&pos);
    let (angle, radius) = config.hardware_to_polar(&pos);
    eprintln!(
        "steps {}, adc {}: ({:.1}, {:.1})mm, {:.2}° at {:.1}mm",
        pos.angle_steps,
        pos.linear_adc,
        p.x,
        p.y,
        angle.to_degrees(),
        radius.get()
    );
    Ok(())
}

fn handle_cmd<L: PlotterLink>(
    plotter: &Plotter<L>,
    settings: &mut Settings,
    runlog: Option<&RunLog>,
    line: &str,
) -> Result<()> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&cmd, args)) = words.split_first() else {
        return Ok(());
    };
    let config = settings.geometry;

    match cmd {
        "quit" | "exit" => return Err(Error::Exit),
        "help" => eprintln!("{HELP}"),
        "home" => plotter.home()?,
        "rotate" => {
            let deg = numbers(args, 1, 1)?[0];
            let steps = config.angle_to_steps(Angle::degrees(deg));
            if steps.abs() > config.calibration.max_steps {
                Err(anyhow!("{deg}° is outside the arm's range"))?;
            }
            plotter.rotate(steps)?;
        }
        "linear" => {
            let mm = numbers(args, 1, 1)?[0];
            let pos = config.polar_to_hardware(Angle::zero(), config.min_radius() + mm.mm())?;
            plotter.linear(pos.linear_adc)?;
        }
        "raw_rotate" => plotter.rotate(integer(args)?)?,
        "raw_linear" => plotter.linear_raw(integer(args)?)?,
        "pos" => show_position(plotter, &config)?,
        "stop" => plotter.stop()?,
        "extend" => plotter.extend_raw()?,
        "retract" => plotter.retract_raw()?,
        "stop_linear" => plotter.stop_linear()?,
        "status" => {
            for line in plotter.status()? {
                eprintln!("{line}");
            }
        }
        "adc" => {
            let [a0, a1, a2, a3] = plotter.debug_adc()?;
            eprintln!("{a0} {a1} {a2} {a3}");
        }
        "step" => {
            let step = numbers(args, 1, 1)?[0];
            if !(step > 0.0 && step.is_finite()) {
                Err(anyhow!("the step must be positive"))?;
            }
            settings.step_mm = step;
        }
        "line" => {
            let n = numbers(args, 4, 4)?;
            let path = shapes::line(Point::new(n[0], n[1]), Point::new(n[2], n[3]));
            run_path(plotter, settings, &path, runlog)?;
        }
        "rect" => {
            let n = numbers(args, 4, 5)?;
            let rotation = Angle::degrees(n.get(4).copied().unwrap_or(0.0));
            let path = shapes::rectangle(Point::new(n[0], n[1]), n[2], n[3], rotation);
            run_path(plotter, settings, &path, runlog)?;
        }
        "circle" => {
            let n = numbers(args, 3, 3)?;
            let path = shapes::circle(Point::new(n[0], n[1]), n[2]);
            run_path(plotter, settings, &path, runlog)?;
        }
        "smooth" => {
            let n = numbers(args, 5, usize::MAX)?;
            let (tension, coords) = (n[0], &n[1..]);
            if !(0.0..=1.0).contains(&tension) {
                Err(anyhow!("the tension must be between 0 and 1"))?;
            }
            if coords.len() % 2 != 0 {
                Err(anyhow!("expected pairs of coordinates"))?;
            }
            let waypoints: Vec<_> = coords.chunks(2).map(|c| Point::new(c[0], c[1])).collect();
            let path = shapes::smooth(&waypoints, tension);
            run_path(plotter, settings, &path, runlog)?;
        }
        other => Err(anyhow!("unknown command {other:?}, try `help`"))?,
    }
    Ok(())
}

fn command_mode<L: PlotterLink>(
    plotter: &Plotter<L>,
    settings: &mut Settings,
    runlog: Option<&RunLog>,
) -> anyhow::Result<()> {
    let mut reed = Reedline::create();
    let prompt = DefaultPrompt::new(
        DefaultPromptSegment::Basic("rotoplot".to_owned()),
        DefaultPromptSegment::Empty,
    );
    eprintln!("type `help` for a list of commands");
    loop {
        let s = match read_cmd(&mut reed, &prompt) {
            Ok(s) => s,
            Err(Error::Exit) => break,
            Err(Error::Err(e)) => return Err(e),
        };
        match handle_cmd(plotter, settings, runlog, s.trim()) {
            Ok(()) => {}
            Err(Error::Exit) => break,
            Err(Error::Err(e)) => eprintln!("error: {e:#}"),
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(port) = args.port {
        settings.port = Some(port);
    }
    if let Some(baud) = args.baud {
        settings.baud = baud;
    }
    if let Some(step) = args.step {
        settings.step_mm = step;
    }
    settings.validate()?;

    let runlog = args.log_dir.as_deref().map(RunLog::create).transpose()?;

    if let Some(svg_path) = &args.simulate {
        let plotter =
            Plotter::new(SimulatedLink::new(settings.geometry)).with_timeouts(settings.timeouts);
        let res = command_mode(&plotter, &mut settings, runlog.as_ref());

        let link = plotter.into_link();
        eprintln!(
            "simulated {:.1}s of plotting, writing {}",
            link.elapsed().as_secs_f64(),
            svg_path.display()
        );
        link.illustrate(File::create(svg_path)?)?;
        res
    } else {
        let port = settings.port.clone().ok_or_else(|| {
            anyhow!("no serial port: use --port, or set \"port\" in the settings file")
        })?;
        let bar = ProgressBar::new_spinner().with_message(format!("Connecting to {port}..."));
        bar.enable_steady_tick(TICK);
        let link = SerialLink::open(&port, settings.baud)?;
        bar.finish_with_message("connected!");

        let plotter = Plotter::new(link).with_timeouts(settings.timeouts);
        command_mode(&plotter, &mut settings, runlog.as_ref())
    }
}
