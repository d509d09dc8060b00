use std::time::Duration;

use log::warn;

use crate::error::Error;
use crate::reporter::Reporter;
use crate::snapshot::RegistrySnapshot;

/// Posts each snapshot to InfluxDB's line protocol write endpoint.
///
/// Scalars become `name[,tag=value...] value=<float>`; distributions carry
/// their full summary as fields. Path separators in names become
/// underscores.
pub struct InfluxDbReporter {
    write_url: String,
    tags: String,
    client: reqwest::blocking::Client,
}

impl InfluxDbReporter {
    /// `base_url` is of the form `http://localhost:8086`.
    pub fn new(
        base_url: &str,
        db_name: &str,
        tags: &[(String, String)],
    ) -> Result<InfluxDbReporter, Error> {
        let base = base_url.trim_end_matches('/');
        let base = if base.is_empty() {
            "http://localhost:8086"
        } else {
            base
        };
        let mut tag_str = String::new();
        for (k, v) in tags {
            tag_str.push_str(&format!(",{}={}", k, v));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(InfluxDbReporter {
            write_url: format!("{}/write?db={}", base, db_name),
            tags: tag_str,
            client,
        })
    }

    fn build_body(&self, snapshot: &RegistrySnapshot) -> String {
        let mut measurements = Vec::new();
        for v in &snapshot.values {
            let name = v.name.replace('/', "_");
            measurements.push(format!("{}{} value={}", name, self.tags, v.value));
        }
        for d in &snapshot.distributions {
            if d.value.count == 0 {
                continue;
            }
            let name = d.name.replace('/', "_");
            measurements.push(format!(
                "{}{} count={}i,sum={},min={},max={},variance={}",
                name, self.tags, d.value.count, d.value.sum, d.value.min, d.value.max,
                d.value.variance
            ));
        }
        measurements.join("\n")
    }

    fn try_report(&self, snapshot: &RegistrySnapshot) -> Result<(), Error> {
        let body = self.build_body(snapshot);
        if body.is_empty() {
            return Ok(());
        }
        let res = self
            .client
            .post(&self.write_url)
            .header("content-type", "application/binary")
            .body(body)
            .send()?;
        if !res.status().is_success() {
            return Err(Error::Report(format!("influxdb: {}", res.status())));
        }
        Ok(())
    }
}

impl Reporter for InfluxDbReporter {
    fn report(&mut self, snapshot: &RegistrySnapshot) {
        if let Err(e) = self.try_report(snapshot) {
            warn!("failed to send metrics to influxdb: {}", e);
        }
    }
}
