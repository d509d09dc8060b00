use std::time::Duration;

use log::warn;

use crate::error::Error;
use crate::reporter::Reporter;
use crate::snapshot::{RegistrySnapshot, ValueKind};

const EZ_URL: &str = "https://api.stathat.com/ez";

/// Posts each snapshot to StatHat's EZ API: counter values as counts,
/// everything else as values; distributions post their mean.
pub struct StatHatReporter {
    email: String,
    url: String,
    client: reqwest::blocking::Client,
}

impl StatHatReporter {
    pub fn new(email: &str) -> Result<StatHatReporter, Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(StatHatReporter {
            email: email.to_string(),
            url: EZ_URL.to_string(),
            client,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_url(mut self, url: &str) -> StatHatReporter {
        self.url = url.to_string();
        self
    }

    fn post_count(&self, stat: &str, count: f64) -> Result<(), Error> {
        self.post(&[
            ("ezkey", self.email.as_str()),
            ("stat", stat),
            ("count", &format!("{}", count)),
        ])
    }

    fn post_value(&self, stat: &str, value: f64) -> Result<(), Error> {
        self.post(&[
            ("ezkey", self.email.as_str()),
            ("stat", stat),
            ("value", &format!("{}", value)),
        ])
    }

    fn post(&self, form: &[(&str, &str)]) -> Result<(), Error> {
        let res = self.client.post(&self.url).form(form).send()?;
        if !res.status().is_success() {
            return Err(Error::Report(format!("stathat: {}", res.status())));
        }
        Ok(())
    }

    fn try_report(&self, snapshot: &RegistrySnapshot) -> Result<(), Error> {
        for v in &snapshot.values {
            let name = v.name.replace('/', ".");
            match v.kind {
                ValueKind::Counter => self.post_count(&name, v.value)?,
                ValueKind::Gauge => self.post_value(&name, v.value)?,
            }
        }
        for d in &snapshot.distributions {
            if d.value.count == 0 {
                continue;
            }
            let name = d.name.replace('/', ".");
            self.post_value(&format!("{}.mean", name), d.value.mean())?;
        }
        Ok(())
    }
}

impl Reporter for StatHatReporter {
    fn report(&mut self, snapshot: &RegistrySnapshot) {
        if let Err(e) = self.try_report(snapshot) {
            warn!("failed to send metrics to stathat: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::StatHatReporter;
    use crate::data::{Counter, Metric};
    use crate::registry::Registry;
    use crate::snapshot::RegistrySnapshot;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Arc;

    // Minimal one-request HTTP server capturing the request, body included.
    fn capture_one_request(listener: TcpListener) -> std::thread::JoinHandle<String> {
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream
                .set_read_timeout(Some(std::time::Duration::from_millis(500)))
                .unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        // The EZ form body is the last thing on the wire.
                        if String::from_utf8_lossy(&buf).contains("count=") {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = stream.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n");
            String::from_utf8_lossy(&buf).to_string()
        })
    }

    #[test]
    fn test_counter_posts_ez_count_form() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = capture_one_request(listener);

        let registry = Registry::new();
        let counter = Arc::new(Counter::new());
        counter.inc(5);
        registry.add("hits", Metric::Counter(counter));

        let mut snap = RegistrySnapshot::new(false);
        snap.snapshot(&registry);

        let reporter = StatHatReporter::new("dev@example.com")
            .unwrap()
            .with_url(&format!("http://{}/ez", addr));
        reporter.try_report(&snap).unwrap();

        let request = handle.join().unwrap();
        assert!(request.contains("POST /ez"));
        assert!(request.contains("ezkey=dev%40example.com"));
        assert!(request.contains("stat=hits"));
        assert!(request.contains("count=5"));
    }
}
