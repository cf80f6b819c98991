use clap::{App, Arg};
use relay::config::{self, Config, ServiceSpec, Tuning};
use relay::logging::{self, error, info, o, Logger};
use relay::net::reactor::Reactor;
use relay::stats::{self, ArenaGauges, ServiceStats};
use signal_hook::consts::{SIGINT, SIGPIPE, SIGTERM};
use signal_hook::flag;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Pause before rebuilding the data plane after a poller failure.
const RETRY_DELAY: Duration = Duration::from_secs(7);

fn main() {
    let matches = App::new("relayd")
        .version("0.1.0")
        .author("Bush Hammer Industries")
        .about("Forwards TCP and UDP traffic to configured targets.")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Path to the config file, in JSON format")
                .takes_value(true)
                .default_value("./config.json"),
        )
        .get_matches();

    let config_path = matches.value_of("config").expect("config has a default");

    let cfg = match Config::load(config_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("relayd: {}", err);
            process::exit(1);
        }
    };

    let root = match logging::init(&cfg.log) {
        Ok(logger) => logger,
        Err(err) => {
            eprintln!("relayd: {}", err);
            process::exit(1);
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    for signal in &[SIGINT, SIGTERM] {
        if let Err(err) = flag::register(*signal, stop.clone()) {
            eprintln!("relayd: cannot install signal handler: {}", err);
            process::exit(1);
        }
    }
    // A registered no-op handler is enough to keep SIGPIPE from killing the
    // process; writes report EPIPE instead.
    if let Err(err) = flag::register(SIGPIPE, Arc::new(AtomicBool::new(false))) {
        eprintln!("relayd: cannot neutralize SIGPIPE: {}", err);
        process::exit(1);
    }

    info!(root, "relayd starting"; "config" => config_path);

    let specs = config::build_specs(&cfg, &root);
    if specs.is_empty() {
        error!(root, "no usable forward entries in the configuration");
        process::exit(1);
    }

    let tuning = Tuning::from(&cfg.service.setting);
    let service_stats: Vec<Arc<ServiceStats>> = specs
        .iter()
        .map(|spec| ServiceStats::new(spec.label.clone(), spec.protocol))
        .collect();
    let gauges = Arc::new(ArenaGauges::new());

    let reporter = {
        let log = root.new(o!("thread" => "statistic"));
        let stop = stop.clone();
        let service_stats = service_stats.clone();
        let gauges = gauges.clone();
        let interval = Duration::from_secs(cfg.statistic.interval.max(1));

        thread::spawn(move || stats::run_reporter(&log, interval, &stop, &service_stats, &gauges))
    };

    let code = run_data_plane(&specs, &tuning, &service_stats, &gauges, &stop, &root);

    stop.store(true, Ordering::Relaxed);
    let _ = reporter.join();

    info!(root, "relayd stopped");
    process::exit(code);
}

/// Builds and runs the reactor, rebuilding it with a back-off after poller
/// failures. The first build failing is a startup failure.
fn run_data_plane(
    specs: &[ServiceSpec],
    tuning: &Tuning,
    service_stats: &[Arc<ServiceStats>],
    gauges: &Arc<ArenaGauges>,
    stop: &Arc<AtomicBool>,
    log: &Logger,
) -> i32 {
    let mut first = true;

    while !stop.load(Ordering::Relaxed) {
        let reactor_log = log.new(o!("thread" => "reactor"));
        let mut reactor = match Reactor::new(
            specs,
            tuning,
            service_stats,
            gauges.clone(),
            stop.clone(),
            reactor_log,
        ) {
            Ok(reactor) => reactor,
            Err(err) => {
                error!(log, "data plane setup failed"; "error" => %err);
                if first {
                    return 1;
                }
                back_off(stop);
                continue;
            }
        };
        first = false;

        match reactor.run() {
            Ok(()) => break,
            Err(err) => {
                error!(log, "data plane failed, rebuilding"; "error" => %err);
                drop(reactor);
                back_off(stop);
            }
        }
    }

    0
}

/// Sleeps through the retry delay in short slices so a stop request is
/// honored promptly.
fn back_off(stop: &Arc<AtomicBool>) {
    let deadline = Instant::now() + RETRY_DELAY;

    while Instant::now() < deadline && !stop.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }
}
