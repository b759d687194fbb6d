use std::{
    io::{self, BufRead, BufReader, Read, Write},
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use rotoplot_protocol::{Cmd, Position, Reply, ReplyError, ReplyReader};
use serde::{Deserialize, Serialize};

/// How long a single read from the serial port blocks before we check the
/// command's deadline again.
const READ_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open serial port: {0}")]
    Open(#[from] serialport::Error),
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no reply to {cmd} after {after:?}")]
    Timeout { cmd: Cmd, after: Duration },
    #[error("the plotter disconnected")]
    Disconnected,
    #[error(transparent)]
    BadReply(#[from] ReplyError),
}

#[derive(Debug, thiserror::Error)]
pub enum PlotterError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The device answered with `ERROR: <message>`.
    #[error("{cmd} failed: {message}")]
    Device { cmd: Cmd, message: String },
}

impl PlotterError {
    pub fn is_device_timeout(&self) -> bool {
        matches!(self, PlotterError::Device { message, .. } if message.contains("timeout"))
    }
}

/// Something that can carry one command to the plotter and bring back its
/// reply.
pub trait PlotterLink: Send {
    fn transact(&mut self, cmd: &Cmd, timeout: Duration) -> Result<Reply, TransportError>;
}

/// The parts of a serial port that [`SerialLink`] uses.
pub trait Port: Read + Write + Send {
    /// Throws away everything that was received but not read yet.
    fn clear_input(&mut self) -> io::Result<()>;
}

impl Port for Box<dyn serialport::SerialPort> {
    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}

pub struct SerialLink<P = Box<dyn serialport::SerialPort>> {
    reader: BufReader<P>,
}

impl SerialLink {
    pub fn open(path: &str, baud: u32) -> Result<Self, TransportError> {
        let port = serialport::new(path, baud).timeout(READ_POLL).open()?;
        log::info!("opened {path} at {baud} baud");
        Ok(SerialLink::new(port))
    }
}

impl<P: Port> SerialLink<P> {
    pub fn new(port: P) -> Self {
        SerialLink {
            reader: BufReader::new(port),
        }
    }

    /// Drops anything left over from an earlier exchange, such as the late
    /// reply to a command that timed out. Replies carry no sequence number,
    /// so otherwise it would be taken as the reply to the next command.
    fn discard_input(&mut self) -> io::Result<()> {
        let stale = self.reader.buffer().len();
        if stale > 0 {
            log::warn!("discarding {stale} bytes of unexpected input");
            self.reader.consume(stale);
        }
        self.reader.get_mut().clear_input()
    }
}

impl<P: Port> PlotterLink for SerialLink<P> {
    fn transact(&mut self, cmd: &Cmd, timeout: Duration) -> Result<Reply, TransportError> {
        self.discard_input()?;
        log::debug!("> {cmd}");
        let port = self.reader.get_mut();
        port.write_all(format!("{cmd}\n").as_bytes())?;
        port.flush()?;

        let deadline = Instant::now() + timeout;
        let mut replies = ReplyReader::new();
        let mut line = Vec::new();
        loop {
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout {
                    cmd: *cmd,
                    after: timeout,
                });
            }
            match self.reader.read_until(b'\n', &mut line) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(_) if line.ends_with(b"\n") => {
                    let text = String::from_utf8_lossy(&line);
                    log::trace!("< {}", text.trim_end());
                    if let Some(reply) = replies.push_line(&text) {
                        return Ok(reply);
                    }
                    line.clear();
                }
                // A partial line; the rest is still on its way.
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Per-command reply timeouts on the host side.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Timeouts {
    /// For commands that answer immediately.
    #[serde(with = "millis")]
    pub fast: Duration,
    /// For commands that wait for the hardware. This needs to be longer
    /// than the device's own timeouts.
    #[serde(with = "millis")]
    pub motion: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            fast: Duration::from_secs(5),
            motion: Duration::from_secs(60),
        }
    }
}

impl Timeouts {
    pub fn for_cmd(&self, cmd: &Cmd) -> Duration {
        if cmd.is_motion() {
            self.motion
        } else {
            self.fast
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// The host's handle to a plotter.
///
/// Commands and their replies never interleave: the link is held for the
/// whole exchange, so a `Plotter` can be shared between threads.
pub struct Plotter<L> {
    link: Mutex<L>,
    timeouts: Timeouts,
}

impl<L: PlotterLink> Plotter<L> {
    pub fn new(link: L) -> Self {
        Plotter {
            link: Mutex::new(link),
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Runs `f` with exclusive access to the link.
    pub fn with_link<T>(&self, f: impl FnOnce(&mut L) -> T) -> T {
        let mut link = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut link)
    }

    pub fn into_link(self) -> L {
        self.link.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends a command and waits for its reply. An `ERROR` reply from the
    /// device comes back as `PlotterError::Device`.
    pub fn send(&self, cmd: Cmd) -> Result<Reply, PlotterError> {
        let timeout = self.timeouts.for_cmd(&cmd);
        match self.with_link(|link| link.transact(&cmd, timeout))? {
            Reply::Error(message) => Err(PlotterError::Device { cmd, message }),
            ok => Ok(ok),
        }
    }

    fn send_ok(&self, cmd: Cmd) -> Result<(), PlotterError> {
        self.send(cmd).map(|_| ())
    }

    /// Homes both axes. If the device times out, homing is retried once
    /// before giving up.
    pub fn home(&self) -> Result<(), PlotterError> {
        match self.send_ok(Cmd::Home) {
            Err(e) if e.is_device_timeout() => {
                log::warn!("{e}, retrying");
                self.send_ok(Cmd::Home)
            }
            res => res,
        }
    }

    pub fn rotate(&self, steps: i32) -> Result<(), PlotterError> {
        self.send_ok(Cmd::Rotate(steps))
    }

    pub fn linear(&self, adc: u16) -> Result<(), PlotterError> {
        self.send_ok(Cmd::Linear(i32::from(adc)))
    }

    /// Sends the raw `LINEAR` command, without any range checks on the host.
    pub fn linear_raw(&self, target: i32) -> Result<(), PlotterError> {
        self.send_ok(Cmd::Linear(target))
    }

    pub fn stop(&self) -> Result<(), PlotterError> {
        self.send_ok(Cmd::Stop)
    }

    pub fn stop_linear(&self) -> Result<(), PlotterError> {
        self.send_ok(Cmd::StopLinear)
    }

    pub fn extend_raw(&self) -> Result<(), PlotterError> {
        self.send_ok(Cmd::ExtendRaw)
    }

    pub fn retract_raw(&self) -> Result<(), PlotterError> {
        self.send_ok(Cmd::RetractRaw)
    }

    pub fn get_position(&self) -> Result<Position, PlotterError> {
        let reply = self.send(Cmd::GetPos)?;
        Ok(reply.position().map_err(TransportError::from)?)
    }

    /// The lines of the device's status report.
    pub fn status(&self) -> Result<Vec<String>, PlotterError> {
        match self.send(Cmd::Status)? {
            Reply::Ok { info, .. } => Ok(info),
            Reply::Error(message) => Err(PlotterError::Device {
                cmd: Cmd::Status,
                message,
            }),
        }
    }

    pub fn debug_adc(&self) -> Result<[u16; 4], PlotterError> {
        let reply = self.send(Cmd::DebugAdc)?;
        Ok(reply.adc().map_err(TransportError::from)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// A link that plays back canned replies, and remembers what it was
    /// sent.
    #[derive(Default)]
    pub struct ScriptedLink {
        pub sent: Vec<Cmd>,
        pub replies: VecDeque<Result<Reply, TransportError>>,
    }

    pub fn ok() -> Result<Reply, TransportError> {
        Ok(Reply::Ok {
            payload: String::new(),
            info: vec![],
        })
    }

    pub fn err(msg: &str) -> Result<Reply, TransportError> {
        Ok(Reply::Error(msg.to_owned()))
    }

    impl PlotterLink for ScriptedLink {
        fn transact(&mut self, cmd: &Cmd, _timeout: Duration) -> Result<Reply, TransportError> {
            self.sent.push(*cmd);
            self.replies.pop_front().unwrap_or_else(ok)
        }
    }

    fn plotter(replies: Vec<Result<Reply, TransportError>>) -> Plotter<ScriptedLink> {
        Plotter::new(ScriptedLink {
            sent: vec![],
            replies: replies.into(),
        })
    }

    #[test]
    fn home_retries_once_on_timeout() {
        let p = plotter(vec![err("HOME linear timeout at ADC 40"), ok()]);
        p.home().unwrap();
        assert_eq!(p.into_link().sent, vec![Cmd::Home, Cmd::Home]);

        let p = plotter(vec![
            err("HOME linear timeout at ADC 40"),
            err("HOME linear timeout at ADC 41"),
        ]);
        let e = p.home().unwrap_err();
        assert_eq!(e.to_string(), "HOME failed: HOME linear timeout at ADC 41");
        assert_eq!(p.into_link().sent.len(), 2);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let p = plotter(vec![err("Unknown command")]);
        assert!(matches!(p.home(), Err(PlotterError::Device { .. })));
        assert_eq!(p.into_link().sent, vec![Cmd::Home]);

        let p = plotter(vec![Err(TransportError::Disconnected)]);
        assert!(matches!(
            p.home(),
            Err(PlotterError::Transport(TransportError::Disconnected))
        ));
        assert_eq!(p.into_link().sent, vec![Cmd::Home]);
    }

    #[test]
    fn payloads() {
        let p = plotter(vec![
            Ok(Reply::Ok {
                payload: "-300 512".to_owned(),
                info: vec![],
            }),
            Ok(Reply::Ok {
                payload: "1 2 3 4".to_owned(),
                info: vec![],
            }),
            Ok(Reply::Ok {
                payload: "garbage".to_owned(),
                info: vec![],
            }),
        ]);
        assert_eq!(
            p.get_position().unwrap(),
            Position {
                angle_steps: -300,
                linear_adc: 512
            }
        );
        assert_eq!(p.debug_adc().unwrap(), [1, 2, 3, 4]);
        assert!(matches!(
            p.get_position(),
            Err(PlotterError::Transport(TransportError::BadReply(_)))
        ));
    }

    #[test]
    fn raw_actuator_commands() {
        let p = plotter(vec![]);
        p.extend_raw().unwrap();
        p.retract_raw().unwrap();
        p.stop_linear().unwrap();
        p.stop().unwrap();
        assert_eq!(
            p.into_link().sent,
            vec![Cmd::ExtendRaw, Cmd::RetractRaw, Cmd::StopLinear, Cmd::Stop]
        );
    }

    /// A serial port whose device answers each command line with the next
    /// canned reply (or with silence, for `None`).
    #[derive(Default)]
    struct FakePort {
        input: VecDeque<u8>,
        written: Vec<u8>,
        replies: VecDeque<Option<&'static str>>,
    }

    impl Read for FakePort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.input.is_empty() {
                return Err(io::ErrorKind::TimedOut.into());
            }
            let n = buf.len().min(self.input.len());
            for (b, x) in buf.iter_mut().zip(self.input.drain(..n)) {
                *b = x;
            }
            Ok(n)
        }
    }

    impl Write for FakePort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            if buf.contains(&b'\n') {
                if let Some(Some(reply)) = self.replies.pop_front() {
                    self.input.extend(reply.bytes());
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Port for FakePort {
        fn clear_input(&mut self) -> io::Result<()> {
            self.input.clear();
            Ok(())
        }
    }

    fn serial(replies: Vec<Option<&'static str>>) -> Plotter<SerialLink<FakePort>> {
        let port = FakePort {
            replies: replies.into(),
            ..FakePort::default()
        };
        Plotter::new(SerialLink::new(port)).with_timeouts(Timeouts {
            fast: Duration::from_millis(20),
            motion: Duration::from_millis(20),
        })
    }

    fn pos(angle_steps: i32, linear_adc: u16) -> Position {
        Position {
            angle_steps,
            linear_adc,
        }
    }

    #[test]
    fn serial_round_trip() {
        let p = serial(vec![Some("STEPPER 0 0 REACHED\r\nOK\r\n"), Some("OK 12 34\r\n")]);
        assert_eq!(p.status().unwrap(), vec!["STEPPER 0 0 REACHED"]);
        assert_eq!(p.get_position().unwrap(), pos(12, 34));
        assert_eq!(p.into_link().reader.get_ref().written, b"STATUS\nGET_POS\n");
    }

    #[test]
    fn late_reply_is_not_taken_for_the_next_one() {
        let p = serial(vec![None, Some("OK 2 2\r\n")]);
        assert!(matches!(
            p.get_position(),
            Err(PlotterError::Transport(TransportError::Timeout { .. }))
        ));
        // The reply to the first command turns up after we gave up on it.
        p.with_link(|link| link.reader.get_mut().input.extend(b"OK 1 1\r\n"));
        assert_eq!(p.get_position().unwrap(), pos(2, 2));
    }

    #[test]
    fn buffered_leftovers_are_discarded() {
        // The first reply arrives together with a stray extra line, which
        // ends up in the read buffer.
        let p = serial(vec![Some("OK 1 1\r\nOK 7 7\r\n"), Some("OK 2 2\r\n")]);
        assert_eq!(p.get_position().unwrap(), pos(1, 1));
        assert_eq!(p.get_position().unwrap(), pos(2, 2));
    }

    #[test]
    fn timeouts_by_command() {
        let t = Timeouts::default();
        assert_eq!(t.for_cmd(&Cmd::Home), Duration::from_secs(60));
        assert_eq!(t.for_cmd(&Cmd::Linear(3)), Duration::from_secs(60));
        assert_eq!(t.for_cmd(&Cmd::GetPos), Duration::from_secs(5));
        assert_eq!(t.for_cmd(&Cmd::Stop), Duration::from_secs(5));
    }
}
