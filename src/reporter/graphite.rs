use std::io::Write;
use std::net::TcpStream;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::warn;

use crate::error::Error;
use crate::reporter::Reporter;
use crate::snapshot::RegistrySnapshot;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Writes each snapshot to a Graphite/Carbon endpoint, one
/// `<name> <value> <unix_ts>\n` line per metric over a connection scoped to
/// the report attempt.
///
/// Path separators in metric names become dots; an optional source label is
/// appended as a final dotted segment.
pub struct GraphiteReporter {
    addr: String,
    source: String,
}

impl GraphiteReporter {
    pub fn new(addr: &str, source: &str) -> GraphiteReporter {
        GraphiteReporter {
            addr: addr.to_string(),
            source: source.to_string(),
        }
    }

    fn sourced_name(&self, name: &str) -> String {
        let name = name.replace('/', ".");
        if self.source.is_empty() {
            name
        } else {
            format!("{}.{}", name, self.source)
        }
    }

    fn try_report(&self, snapshot: &RegistrySnapshot) -> Result<(), Error> {
        let mut conn = connect(&self.addr)?;
        let ts = unix_now();

        for v in &snapshot.values {
            writeln!(conn, "{} {} {}", self.sourced_name(&v.name), v.value, ts)?;
        }
        for d in &snapshot.distributions {
            let field = |suffix: &str| self.sourced_name(&format!("{}.{}", d.name, suffix));
            writeln!(conn, "{} {} {}", field("count"), d.value.count, ts)?;
            writeln!(conn, "{} {} {}", field("sum"), d.value.sum, ts)?;
            writeln!(conn, "{} {} {}", field("min"), d.value.min, ts)?;
            writeln!(conn, "{} {} {}", field("max"), d.value.max, ts)?;
            writeln!(conn, "{} {} {}", field("mean"), d.value.mean(), ts)?;
        }
        conn.flush()?;
        Ok(())
    }
}

fn connect(addr: &str) -> Result<TcpStream, Error> {
    use std::net::ToSocketAddrs;
    let mut last_err = None;
    for sock_addr in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&sock_addr, CONNECT_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(match last_err {
        Some(e) => Error::Io(e),
        None => Error::Config(format!("no addresses resolved for {}", addr)),
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Reporter for GraphiteReporter {
    fn report(&mut self, snapshot: &RegistrySnapshot) {
        if let Err(e) = self.try_report(snapshot) {
            warn!("failed to send metrics to graphite/carbon at {}: {}", self.addr, e);
        }
    }
}
