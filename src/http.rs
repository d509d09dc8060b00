use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};
use tiny_http::{Header, Method, Response, Server, StatusCode};

use crate::data::Metric;
use crate::error::Error;
use crate::registry::MetricSource;

/// Serves the registry as JSON over HTTP.
///
/// `GET /` answers with one object whose keys are metric names and whose
/// values are each metric's JSON serialization. Anything else is a 404.
pub struct RegistryServer {
    server: Arc<Server>,
    handle: Option<JoinHandle<()>>,
}

impl RegistryServer {
    /// Binds `addr` and starts answering requests on a background thread.
    pub fn serve<A: ToSocketAddrs>(
        addr: A,
        source: Arc<dyn MetricSource>,
    ) -> Result<RegistryServer, Error> {
        let server =
            Arc::new(Server::http(addr).map_err(|e| Error::Config(format!("http bind: {}", e)))?);
        let accept = Arc::clone(&server);
        let handle = thread::spawn(move || {
            for request in accept.incoming_requests() {
                handle_request(request, &*source);
            }
        });
        Ok(RegistryServer {
            server,
            handle: Some(handle),
        })
    }

    /// Unblocks the accept loop and joins the serving thread.
    pub fn stop(mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_request(request: tiny_http::Request, source: &dyn MetricSource) {
    debug!("{} {}", request.method(), request.url());
    if request.method() != &Method::Get || request.url() != "/" {
        let _ = request.respond(Response::new_empty(StatusCode(404)));
        return;
    }

    let body = render_registry(source);
    let content_type =
        Header::from_bytes(&b"Content-Type"[..], &b"application/json; charset=utf-8"[..])
            .expect("static header is valid");
    let response = Response::from_string(body).with_header(content_type);
    if let Err(e) = request.respond(response) {
        warn!("failed to respond to metrics request: {}", e);
    }
}

/// One JSON object mapping metric names to their serialized values.
pub fn render_registry(source: &dyn MetricSource) -> String {
    let mut entries: Vec<(String, Metric)> = Vec::new();
    let _ = source.each(&mut |name, metric| {
        entries.push((name.to_string(), metric.clone()));
        Ok(())
    });

    let mut out = String::from("{\n");
    let mut first = true;
    for (name, metric) in entries {
        match (serde_json::to_string(&name), serde_json::to_string(&metric)) {
            (Ok(key), Ok(json)) => {
                if !first {
                    out.push_str(",\n");
                }
                first = false;
                out.push_str(&format!("{}: {}", key, json));
            }
            (_, Err(e)) | (Err(e), _) => warn!("failed to encode metric {}: {}", name, e),
        }
    }
    out.push_str("\n}\n");
    out
}
