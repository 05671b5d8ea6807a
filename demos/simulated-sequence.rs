use log::{Level, LevelFilter, Log, Metadata, Record};
use std::{str::FromStr, time::Duration};
use stepper_sequencer::{
    ActuatorConfig, MachineConfig, Origin, ReturnMode, SequenceConfig,
    SequenceOrchestrator, SimulatedLine,
};
use structopt::StructOpt;

fn main() {
    let args = Args::from_args();

    log::set_logger(&LOGGER).expect("A logger has already been installed");
    log::set_max_level(if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    });

    let (tx, rx) = crossbeam_channel::unbounded();
    let engine = SequenceOrchestrator::new(MachineConfig::reference(), SimulatedLine::new(), tx);

    let mut handle = match engine.start(args.sequence()) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("Unable to start: {}", e);
            std::process::exit(1);
        },
    };

    for event in rx.iter() {
        println!("[{:8.3}] {}", event.at.as_secs_f64(), event);

        if let Some(limit) = args.stop_after {
            if event.at.as_secs_f64() >= limit {
                if args.return_home {
                    handle.stop_and_return();
                } else {
                    handle.stop();
                }
            }
        }

        if event.kind.is_terminal() {
            break;
        }
    }

    let summary = handle.wait();
    println!();
    println!(
        "{}/{} repetitions completed{}",
        summary.completed_repetitions,
        summary.total_repetitions,
        if summary.stopped { " (stopped)" } else { "" }
    );

    for (i, actuator) in summary.actuators.iter().enumerate() {
        println!(
            "Motor {}: {} with {} steps outstanding",
            i + 1,
            actuator.phase,
            actuator.steps_moved
        );
    }

    for pins in engine.machine().actuator_pins() {
        println!("{}: {} pulses", pins.step, engine.line().pulses(pins.step));
    }
}

#[derive(Debug, StructOpt)]
pub struct Args {
    #[structopt(short = "r", long = "repetitions", default_value = "1")]
    repetitions: u32,
    #[structopt(
        short = "m",
        long = "return-mode",
        default_value = "together",
        help = "together or sequential"
    )]
    return_mode: Mode,
    #[structopt(
        short = "s",
        long = "speed",
        default_value = "60",
        help = "The speed of every motor, in RPM"
    )]
    speed: f64,
    #[structopt(short = "a", long = "angle", default_value = "45")]
    angle: f64,
    #[structopt(
        long = "stagger",
        default_value = "0.5",
        help = "Seconds between each motor's start"
    )]
    stagger: f64,
    #[structopt(long = "origin-b", help = "Start every motor from the B position")]
    origin_b: bool,
    #[structopt(
        long = "stop-after",
        parse(try_from_str = parse_seconds),
        help = "Stop the run after this many seconds"
    )]
    stop_after: Option<f64>,
    #[structopt(long = "return-home", help = "Send the motors home after stopping")]
    return_home: bool,
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,
}

impl Args {
    pub fn sequence(&self) -> SequenceConfig {
        let origin = if self.origin_b { Origin::B } else { Origin::A };

        let actuators = (0..MachineConfig::reference().actuator_count())
            .map(|i| {
                ActuatorConfig::new(self.speed, self.angle)
                    .with_origin(origin)
                    .with_start_delay(Duration::from_secs_f64((self.stagger * i as f64).max(0.0)))
            })
            .collect();

        SequenceConfig::new(actuators)
            .with_repetitions(self.repetitions)
            .with_return_mode(self.return_mode.0)
    }
}

fn parse_seconds(s: &str) -> Result<f64, String> {
    let seconds: f64 = s.parse().map_err(|e| format!("\"{}\": {}", s, e))?;

    if seconds.is_finite() && seconds >= 0.0 {
        Ok(seconds)
    } else {
        Err(format!("Expected a non-negative number of seconds, found {}", s))
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
struct Mode(ReturnMode);

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "together" => Ok(Mode(ReturnMode::Together)),
            "sequential" | "one-at-a-time" => Ok(Mode(ReturnMode::Sequential)),
            other => Err(format!("Unknown return mode: {}", other)),
        }
    }
}

static LOGGER: StderrLogger = StderrLogger;

/// Writes log records to stderr so they don't interleave with the events
/// printed to stdout.
struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!("{:<5} {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}
