use std::net::UdpSocket;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use getopts::Options;
use log::{error, info, warn};

use tally::daemon::DEFAULT_REPORT_INTERVAL;
use tally::{
    Aggregator, CloudWatchReporter, GraphiteReporter, InfluxDbReporter, LibratoReporter,
    RegistryServer, Reporter, StatHatReporter,
};

struct Config {
    listen_addr: String,
    http_addr: String,
    percentiles: Vec<(String, f64)>,
    graphite: String,
    graphite_source: String,
    librato_username: String,
    librato_token: String,
    librato_source: String,
    stathat_email: String,
    cw_region: String,
    cw_access_key: String,
    cw_secret_key: String,
    cw_namespace: String,
    influx_url: String,
    influx_db: String,
}

fn opts() -> Options {
    let mut opts = Options::new();
    opts.optopt("l", "listen", "UDP address to listen on", "HOST:PORT");
    opts.optopt("h", "http", "HTTP/debug address (empty to disable)", "HOST:PORT");
    opts.optopt(
        "p",
        "percentiles",
        "comma separated list of percentiles to record",
        "CSV",
    );
    opts.optopt("g", "graphite", "host:port for Graphite's Carbon", "HOST:PORT");
    opts.optopt("u", "librato-username", "Librato metrics username", "USER");
    opts.optopt("t", "librato-token", "Librato metrics token", "TOKEN");
    opts.optopt("s", "stathat-email", "StatHat email", "EMAIL");
    opts.optopt("", "source", "source label for Graphite/Librato", "NAME");
    opts.optopt("", "cw-region", "CloudWatch region", "REGION");
    opts.optopt("", "cw-access-key", "CloudWatch access key", "KEY");
    opts.optopt("", "cw-secret-key", "CloudWatch secret key", "KEY");
    opts.optopt("", "cw-namespace", "CloudWatch namespace", "NAMESPACE");
    opts.optopt("", "influx-url", "InfluxDB base URL", "URL");
    opts.optopt("", "influx-db", "InfluxDB database name", "NAME");
    opts.optflag("", "help", "print this help menu");
    opts
}

fn parse_config(args: &[String]) -> Result<Config, String> {
    let opts = opts();
    let matches = opts.parse(args).map_err(|e| e.to_string())?;
    if matches.opt_present("help") {
        print!("{}", opts.usage("Usage: tallyd [options]"));
        process::exit(0);
    }

    let raw_percentiles = matches
        .opt_str("p")
        .unwrap_or_else(|| "0.90,0.99,0.999".to_string());
    let mut percentiles = Vec::new();
    for s in raw_percentiles.split(',') {
        let s = s.trim();
        let p: f64 = s
            .parse()
            .map_err(|e| format!("couldn't parse percentile {:?}: {}", s, e))?;
        if !(0.0..=1.0).contains(&p) {
            return Err(format!("invalid percentile: {}", p));
        }
        percentiles.push((s.replacen("0.", "p", 1), p));
    }

    Ok(Config {
        listen_addr: matches
            .opt_str("l")
            .unwrap_or_else(|| "0.0.0.0:5252".to_string()),
        http_addr: matches
            .opt_str("h")
            .unwrap_or_else(|| "0.0.0.0:5251".to_string()),
        percentiles,
        graphite: matches.opt_str("g").unwrap_or_default(),
        graphite_source: matches.opt_str("source").unwrap_or_default(),
        librato_username: matches.opt_str("u").unwrap_or_default(),
        librato_token: matches.opt_str("t").unwrap_or_default(),
        librato_source: matches.opt_str("source").unwrap_or_default(),
        stathat_email: matches.opt_str("s").unwrap_or_default(),
        cw_region: matches.opt_str("cw-region").unwrap_or_default(),
        cw_access_key: matches.opt_str("cw-access-key").unwrap_or_default(),
        cw_secret_key: matches.opt_str("cw-secret-key").unwrap_or_default(),
        cw_namespace: matches.opt_str("cw-namespace").unwrap_or_default(),
        influx_url: matches.opt_str("influx-url").unwrap_or_default(),
        influx_db: matches.opt_str("influx-db").unwrap_or_default(),
    })
}

fn build_sinks(config: &Config) -> Result<Vec<(String, Box<dyn Reporter>)>, String> {
    let mut sinks: Vec<(String, Box<dyn Reporter>)> = Vec::new();

    if !config.graphite.is_empty() {
        sinks.push((
            "graphite".to_string(),
            Box::new(GraphiteReporter::new(
                &config.graphite,
                &config.graphite_source,
            )),
        ));
    }
    if !config.librato_username.is_empty() && !config.librato_token.is_empty() {
        let reporter = LibratoReporter::new(
            &config.librato_username,
            &config.librato_token,
            &config.librato_source,
        )
        .map_err(|e| e.to_string())?;
        sinks.push(("librato".to_string(), Box::new(reporter)));
    }
    if !config.stathat_email.is_empty() {
        let reporter = StatHatReporter::new(&config.stathat_email).map_err(|e| e.to_string())?;
        sinks.push(("stathat".to_string(), Box::new(reporter)));
    }
    if !config.cw_region.is_empty() {
        let reporter = CloudWatchReporter::new(
            &config.cw_region,
            &config.cw_access_key,
            &config.cw_secret_key,
            "",
            &config.cw_namespace,
            Vec::new(),
            Duration::from_secs(15),
        )
        .map_err(|e| e.to_string())?;
        sinks.push(("cloudwatch".to_string(), Box::new(reporter)));
    }
    if !config.influx_url.is_empty() {
        let reporter = InfluxDbReporter::new(&config.influx_url, &config.influx_db, &[])
            .map_err(|e| e.to_string())?;
        sinks.push(("influxdb".to_string(), Box::new(reporter)));
    }

    if sinks.is_empty() {
        return Err(
            "either StatHat email, Librato username & token, Graphite/Carbon, CloudWatch, \
             or InfluxDB required"
                .to_string(),
        );
    }
    Ok(sinks)
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match parse_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };
    let sinks = match build_sinks(&config) {
        Ok(sinks) => sinks,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    let aggregator = Aggregator::new(config.percentiles.clone());
    for (name, sink) in sinks {
        aggregator.add_sink(&name, sink);
    }

    let _http_server = if config.http_addr.is_empty() {
        None
    } else {
        match RegistryServer::serve(config.http_addr.as_str(), Arc::new(aggregator.registry())) {
            Ok(server) => {
                info!("serving debug metrics on http://{}/", config.http_addr);
                Some(server)
            }
            Err(e) => {
                error!("failed to bind http address {}: {}", config.http_addr, e);
                process::exit(1);
            }
        }
    };

    aggregator.start(DEFAULT_REPORT_INTERVAL);

    let socket = match UdpSocket::bind(&config.listen_addr) {
        Ok(socket) => socket,
        Err(e) => {
            error!("failed to bind {}: {}", config.listen_addr, e);
            process::exit(1);
        }
    };
    info!("listening for metrics on {}", config.listen_addr);

    let mut buf = [0u8; 4096];
    loop {
        match socket.recv_from(&mut buf) {
            Ok((n, _)) => aggregator.record_packet(&buf[..n]),
            Err(e) => warn!("udp receive failed: {}", e),
        }
    }
}
