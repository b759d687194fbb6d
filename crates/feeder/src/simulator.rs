//! A plotter that lives entirely in memory, for dry runs.
//!
//! This runs the real device code against simulated hardware, talking to it
//! over the same text protocol that goes over the wire.

use std::{collections::VecDeque, fmt, time::Duration};

use rotoplot_device::{
    hal::SerialPort,
    sim::{SimActuator, SimClock, SimStepper},
    Device,
};
use rotoplot_geom::{Config, Point, Position};
use rotoplot_protocol::{Cmd, Reply, ReplyReader};
use svg::{
    node::element::{path::Data, Circle, Path, Rectangle},
    Document,
};

use crate::connection::{PlotterLink, TransportError};

/// Both ends of an in-memory serial line.
#[derive(Default)]
struct Loopback {
    to_device: VecDeque<u8>,
    from_device: String,
}

impl fmt::Write for Loopback {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.from_device.push_str(s);
        Ok(())
    }
}

impl SerialPort for Loopback {
    fn read_byte(&mut self) -> Option<u8> {
        self.to_device.pop_front()
    }
}

pub struct SimulatedLink {
    device: Device<SimStepper, SimActuator, SimClock>,
    clock: SimClock,
    config: Config,
    wire: Loopback,
    track: Vec<Position>,
}

impl SimulatedLink {
    /// A simulated plotter sitting at its home position.
    pub fn new(config: Config) -> Self {
        let cal = config.calibration;
        let clock = SimClock::new();
        let device = Device::new(
            SimStepper::new(clock.clone(), cal.home_steps),
            SimActuator::new(clock.clone(), cal.adc_min, cal.adc_max, cal.adc_home),
            clock.clone(),
            cal,
        );
        SimulatedLink {
            device,
            clock,
            config,
            wire: Loopback::default(),
            track: vec![config.home_position()],
        }
    }

    /// The pen positions after each motion command, starting from home.
    pub fn track(&self) -> &[Position] {
        &self.track
    }

    /// How much simulated time has passed.
    pub fn elapsed(&self) -> Duration {
        use rotoplot_device::hal::Clock as _;
        Duration::from_millis(self.clock.now_ms())
    }

    /// Draws the board and the pen's track as an SVG.
    pub fn illustrate(&self, out: impl std::io::Write) -> anyhow::Result<()> {
        // Scale everything up by 10, because some viewers don't like small svgs.
        const SCALE: f64 = 10.0;
        // SVG's y axis points down.
        let svg_point = |p: Point| (p.x * SCALE, -p.y * SCALE);

        let ws = self.config.workspace();
        let board = Rectangle::new()
            .set("x", -ws.max_x * SCALE)
            .set("y", -ws.max_y * SCALE)
            .set("width", 2.0 * ws.max_x * SCALE)
            .set("height", (ws.max_y - ws.min_y) * SCALE)
            .set("fill", "none")
            .set("stroke", "grey")
            .set("stroke-width", 2);

        let points: Vec<_> = self
            .track
            .iter()
            .map(|pos| svg_point(self.config.hardware_to_point(pos)))
            .collect();

        let mut document = Document::new()
            .set(
                "viewBox",
                (
                    -ws.max_x * SCALE,
                    -ws.max_y * SCALE,
                    2.0 * ws.max_x * SCALE,
                    ws.max_y * SCALE,
                ),
            )
            .add(board)
            .add(
                Circle::new()
                    .set("cx", 0.0)
                    .set("cy", 0.0)
                    .set("r", 10.0)
                    .set("fill", "red"),
            );

        if let Some((&first, rest)) = points.split_first() {
            let mut data = Data::new().move_to(first);
            for &p in rest {
                data = data.line_to(p);
            }
            document = document.add(
                Path::new()
                    .set("fill", "none")
                    .set("stroke", "black")
                    .set("stroke-width", 1)
                    .set("d", data),
            );
        }
        for (x, y) in points {
            document = document.add(
                Circle::new()
                    .set("cx", x)
                    .set("cy", y)
                    .set("r", 2.0)
                    .set("fill", "blue"),
            );
        }

        svg::write(out, &document)?;
        Ok(())
    }
}

impl PlotterLink for SimulatedLink {
    fn transact(&mut self, cmd: &Cmd, _timeout: Duration) -> Result<Reply, TransportError> {
        log::debug!("> {cmd}");
        self.wire.to_device.extend(format!("{cmd}\n").bytes());
        self.device
            .poll(&mut self.wire)
            .map_err(|_| TransportError::Disconnected)?;

        if cmd.is_motion() {
            let pos = self.device.position();
            self.track.push(pos);
        }

        let text = std::mem::take(&mut self.wire.from_device);
        let mut replies = ReplyReader::new();
        for line in text.lines() {
            log::trace!("< {line}");
            if let Some(reply) = replies.push_line(line) {
                return Ok(reply);
            }
        }
        Err(TransportError::Disconnected)
    }
}
