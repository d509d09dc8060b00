use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use log::warn;
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::reporter::Reporter;
use crate::snapshot::RegistrySnapshot;

const API_VERSION: &str = "2010-08-01";
const SERVICE: &str = "monitoring";
// PutMetricData rejects payloads over 40 KB.
const MAX_BODY_BYTES: usize = 40 * 1024;

type HmacSha256 = Hmac<Sha256>;

enum MetricData {
    Value(f64),
    Statistics {
        sum: f64,
        sample_count: u64,
        minimum: f64,
        maximum: f64,
    },
}

struct CwMetric {
    name: String,
    data: MetricData,
}

/// Posts each snapshot to CloudWatch as AWS4-signed `PutMetricData` form
/// requests, splitting the metric set across requests when a payload would
/// exceed the 40 KB limit.
pub struct CloudWatchReporter {
    endpoint: String,
    host: String,
    namespace: String,
    access_key: String,
    secret_key: String,
    security_token: String,
    dimensions: Vec<(String, String)>,
    client: reqwest::blocking::Client,
}

impl CloudWatchReporter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        region: &str,
        access_key: &str,
        secret_key: &str,
        security_token: &str,
        namespace: &str,
        dimensions: Vec<(String, String)>,
        timeout: Duration,
    ) -> Result<CloudWatchReporter, Error> {
        let host = format!("monitoring.{}.amazonaws.com", region);
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(CloudWatchReporter {
            endpoint: format!("https://{}", host),
            host,
            namespace: namespace.to_string(),
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            security_token: security_token.to_string(),
            dimensions,
            client,
        })
    }

    fn collect(&self, snapshot: &RegistrySnapshot) -> Vec<CwMetric> {
        let mut metrics = Vec::new();
        for v in &snapshot.values {
            metrics.push(CwMetric {
                name: v.name.replace('/', "."),
                data: MetricData::Value(v.value),
            });
        }
        for d in &snapshot.distributions {
            if d.value.count == 0 {
                continue;
            }
            metrics.push(CwMetric {
                name: d.name.replace('/', "."),
                data: MetricData::Statistics {
                    sum: d.value.sum,
                    sample_count: d.value.count,
                    minimum: d.value.min,
                    maximum: d.value.max,
                },
            });
        }
        metrics
    }

    fn base_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("Action".to_string(), "PutMetricData".to_string()),
            ("Namespace".to_string(), self.namespace.clone()),
            ("Version".to_string(), API_VERSION.to_string()),
        ];
        if !self.security_token.is_empty() {
            params.push(("SecurityToken".to_string(), self.security_token.clone()));
        }
        params
    }

    fn member_params(&self, index: usize, metric: &CwMetric) -> Vec<(String, String)> {
        let prefix = format!("MetricData.member.{}.", index);
        let mut params = vec![(format!("{}MetricName", prefix), metric.name.clone())];
        match &metric.data {
            MetricData::Value(v) => {
                params.push((format!("{}Value", prefix), format!("{}", v)));
            }
            MetricData::Statistics {
                sum,
                sample_count,
                minimum,
                maximum,
            } => {
                params.push((format!("{}StatisticValues.Sum", prefix), format!("{}", sum)));
                params.push((
                    format!("{}StatisticValues.SampleCount", prefix),
                    format!("{}", sample_count),
                ));
                params.push((
                    format!("{}StatisticValues.Minimum", prefix),
                    format!("{}", minimum),
                ));
                params.push((
                    format!("{}StatisticValues.Maximum", prefix),
                    format!("{}", maximum),
                ));
            }
        }
        for (d, (name, value)) in self.dimensions.iter().enumerate() {
            let dp = format!("{}Dimensions.member.{}.", prefix, d + 1);
            params.push((format!("{}Name", dp), name.clone()));
            params.push((format!("{}Value", dp), value.clone()));
        }
        params
    }

    /// Splits the metric set into form bodies that each stay under the
    /// payload limit. Member numbering restarts at 1 in every body.
    fn build_bodies(&self, metrics: &[CwMetric]) -> Vec<String> {
        let mut bodies = Vec::new();
        let base = encode_form(&self.base_params());
        let mut body = base.clone();
        let mut index = 1;

        for metric in metrics {
            let member = encode_form(&self.member_params(index, metric));
            if body.len() + 1 + member.len() > MAX_BODY_BYTES && index > 1 {
                bodies.push(body);
                body = base.clone();
                index = 1;
                let member = encode_form(&self.member_params(index, metric));
                body.push('&');
                body.push_str(&member);
            } else {
                body.push('&');
                body.push_str(&member);
            }
            index += 1;
        }
        if index > 1 {
            bodies.push(body);
        }
        bodies
    }

    fn try_report(&self, snapshot: &RegistrySnapshot) -> Result<(), Error> {
        let metrics = self.collect(snapshot);
        if metrics.is_empty() {
            return Ok(());
        }
        for body in self.build_bodies(&metrics) {
            self.post_signed(&body)?;
        }
        Ok(())
    }

    fn post_signed(&self, body: &str) -> Result<(), Error> {
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let content_type = "application/x-www-form-urlencoded; charset=utf-8";
        let payload_hash = hex::encode(Sha256::digest(body.as_bytes()));

        let mut canonical_headers = format!(
            "content-type:{}\nhost:{}\nx-amz-date:{}\n",
            content_type, self.host, amz_date
        );
        let mut signed_headers = "content-type;host;x-amz-date".to_string();
        if !self.security_token.is_empty() {
            canonical_headers.push_str(&format!("x-amz-security-token:{}\n", self.security_token));
            signed_headers.push_str(";x-amz-security-token");
        }

        let canonical_request = format!(
            "POST\n/\n\n{}\n{}\n{}",
            canonical_headers, signed_headers, payload_hash
        );
        let scope = format!("{}/{}/{}/aws4_request", date, region_of(&self.host), SERVICE);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let mut key = hmac(format!("AWS4{}", self.secret_key).as_bytes(), date.as_bytes());
        key = hmac(&key, region_of(&self.host).as_bytes());
        key = hmac(&key, SERVICE.as_bytes());
        key = hmac(&key, b"aws4_request");
        let signature = hex::encode(hmac(&key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, scope, signed_headers, signature
        );

        let mut req = self
            .client
            .post(&self.endpoint)
            .header("content-type", content_type)
            .header("x-amz-date", amz_date.as_str())
            .header("authorization", authorization.as_str());
        if !self.security_token.is_empty() {
            req = req.header("x-amz-security-token", self.security_token.as_str());
        }
        let res = req.body(body.to_string()).send()?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().unwrap_or_default();
            return Err(Error::Report(format!("cloudwatch: {} {}", status, text)));
        }
        Ok(())
    }
}

fn region_of(host: &str) -> &str {
    // monitoring.<region>.amazonaws.com
    host.split('.').nth(1).unwrap_or("us-east-1")
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn encode_form(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

// RFC 3986 unreserved characters pass; everything else is %XX, as the
// signature algorithm requires.
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

impl Reporter for CloudWatchReporter {
    fn report(&mut self, snapshot: &RegistrySnapshot) {
        if let Err(e) = self.try_report(snapshot) {
            warn!("failed to send metrics to cloudwatch: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{percent_encode, CloudWatchReporter};
    use crate::data::{Counter, Distribution, Metric};
    use crate::registry::Registry;
    use crate::snapshot::RegistrySnapshot;
    use std::sync::Arc;
    use std::time::Duration;

    fn reporter() -> CloudWatchReporter {
        CloudWatchReporter::new(
            "us-east-1",
            "AKID",
            "secret",
            "",
            "test/namespace",
            vec![("stage".to_string(), "prod".to_string())],
            Duration::from_secs(15),
        )
        .unwrap()
    }

    #[test]
    fn test_percent_encode() {
        assert_eq!(percent_encode("a-b_c.d~e"), "a-b_c.d~e");
        assert_eq!(percent_encode("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn test_member_params_value_and_statistics() {
        let registry = Registry::new();
        let counter = Arc::new(Counter::new());
        counter.inc(3);
        registry.add("hits", Metric::Counter(counter));
        let dist = Arc::new(Distribution::new());
        dist.update(2.0);
        dist.update(6.0);
        registry.add("size", Metric::Distribution(dist));

        let mut snap = RegistrySnapshot::new(false);
        snap.snapshot(&registry);

        let r = reporter();
        let metrics = r.collect(&snap);
        assert_eq!(metrics.len(), 2);

        let bodies = r.build_bodies(&metrics);
        assert_eq!(bodies.len(), 1);
        let body = &bodies[0];
        assert!(body.contains("Action=PutMetricData"));
        assert!(body.contains("Version=2010-08-01"));
        assert!(body.contains("Namespace=test%2Fnamespace"));
        assert!(body.contains("MetricData.member.1.MetricName=hits"));
        assert!(body.contains("MetricData.member.1.Value=3"));
        assert!(body.contains("MetricData.member.2.StatisticValues.Sum=8"));
        assert!(body.contains("MetricData.member.2.StatisticValues.SampleCount=2"));
        assert!(body.contains("MetricData.member.2.StatisticValues.Minimum=2"));
        assert!(body.contains("MetricData.member.2.StatisticValues.Maximum=6"));
        assert!(body.contains("Dimensions.member.1.Name=stage"));
        assert!(body.contains("Dimensions.member.1.Value=prod"));
    }

    #[test]
    fn test_large_payloads_split_under_40kb() {
        let registry = Registry::new();
        for i in 0..2000 {
            let c = Arc::new(Counter::new());
            c.inc(i);
            registry.add(
                &format!("some/quite/long/metric/name/number/{:05}", i),
                Metric::Counter(c),
            );
        }
        let mut snap = RegistrySnapshot::new(false);
        snap.snapshot(&registry);

        let r = reporter();
        let metrics = r.collect(&snap);
        let bodies = r.build_bodies(&metrics);
        assert!(bodies.len() > 1);
        for body in &bodies {
            assert!(body.len() <= super::MAX_BODY_BYTES);
            assert!(body.contains("MetricData.member.1.MetricName="));
        }
    }
}
