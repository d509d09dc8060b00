use std::time::Duration;

use log::warn;
use serde::Serialize;

use crate::error::Error;
use crate::reporter::Reporter;
use crate::snapshot::{RegistrySnapshot, ValueKind};

const API_URL: &str = "https://metrics-api.librato.com/v1/metrics";

#[derive(Serialize)]
struct Payload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    counters: Vec<Scalar>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    gauges: Vec<Gauge>,
}

#[derive(Serialize)]
struct Scalar {
    name: String,
    value: f64,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Gauge {
    Value {
        name: String,
        value: f64,
    },
    Aggregate {
        name: String,
        count: u64,
        sum: f64,
        min: f64,
        max: f64,
        sum_squares: f64,
    },
}

/// Posts each snapshot to the Librato metrics API as a JSON payload of
/// counters and gauges; distributions become full gauge aggregates.
pub struct LibratoReporter {
    username: String,
    token: String,
    source: String,
    url: String,
    client: reqwest::blocking::Client,
}

impl LibratoReporter {
    pub fn new(username: &str, token: &str, source: &str) -> Result<LibratoReporter, Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(LibratoReporter {
            username: username.to_string(),
            token: token.to_string(),
            source: source.to_string(),
            url: API_URL.to_string(),
            client,
        })
    }

    #[cfg(test)]
    fn with_url(mut self, url: &str) -> LibratoReporter {
        self.url = url.to_string();
        self
    }

    fn build_payload<'a>(&'a self, snapshot: &RegistrySnapshot) -> Payload<'a> {
        let mut counters = Vec::new();
        let mut gauges = Vec::new();

        for v in &snapshot.values {
            let name = v.name.replace('/', ".");
            match v.kind {
                ValueKind::Counter => counters.push(Scalar {
                    name,
                    value: v.value,
                }),
                ValueKind::Gauge => gauges.push(Gauge::Value {
                    name,
                    value: v.value,
                }),
            }
        }
        for d in &snapshot.distributions {
            if d.value.count == 0 {
                continue;
            }
            let mean = d.value.mean();
            // Librato derives stddev from sum_squares; reconstruct it from
            // the variance we carry.
            let sum_squares =
                d.value.variance * (d.value.count.saturating_sub(1)) as f64 + mean * d.value.sum;
            gauges.push(Gauge::Aggregate {
                name: d.name.replace('/', "."),
                count: d.value.count,
                sum: d.value.sum,
                min: d.value.min,
                max: d.value.max,
                sum_squares,
            });
        }

        Payload {
            source: if self.source.is_empty() {
                None
            } else {
                Some(&self.source)
            },
            counters,
            gauges,
        }
    }

    fn try_report(&self, snapshot: &RegistrySnapshot) -> Result<(), Error> {
        let payload = self.build_payload(snapshot);
        if payload.counters.is_empty() && payload.gauges.is_empty() {
            return Ok(());
        }
        let res = self
            .client
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.token))
            .json(&payload)
            .send()?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(Error::Report(format!("librato: {} {}", status, body)));
        }
        Ok(())
    }
}

impl Reporter for LibratoReporter {
    fn report(&mut self, snapshot: &RegistrySnapshot) {
        if let Err(e) = self.try_report(snapshot) {
            warn!("failed to send metrics to librato: {}", e);
        }
    }
}
