use std::collections::HashMap;
use std::fmt::Write as _;

use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Response, StatusCode};
use serde::Serialize;

use super::{BoxBody, full_body};
use crate::registry::{ConnectionRegistry, EndpointEvent, RecordSnapshot};

#[derive(Debug, Serialize)]
struct StatusReport {
    connections: Vec<RecordSnapshot>,
    events: Vec<EndpointEvent>,
}

/// Dump of live connections and recent events, as text or with
/// `?format=json` as JSON.
pub(super) fn render(registry: &ConnectionRegistry, params: &HashMap<String, String>) -> Response<BoxBody> {
    let report = StatusReport {
        connections: registry.snapshot(),
        events: registry.events(),
    };

    let (body, content_type) = match params.get("format").map(String::as_str) {
        Some("json") => match serde_json::to_string_pretty(&report) {
            Ok(json) => (json, "application/json"),
            Err(e) => (format!("ERROR {e}\r\n"), "text/plain"),
        },
        _ => (render_text(&report), "text/plain"),
    };

    let mut response = Response::new(full_body(body));
    *response.status_mut() = StatusCode::OK;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn render_text(report: &StatusReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Active sessions: {}", report.connections.len());
    let _ = writeln!(out);
    for record in &report.connections {
        let _ = writeln!(
            out,
            "{} => {} user={} created={} expires={}",
            record.id,
            record.destination,
            record.user,
            humantime::format_rfc3339_seconds(record.created_at),
            humantime::format_rfc3339_seconds(record.expires_at),
        );
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Events:");
    let _ = writeln!(out);
    for event in &report.events {
        let _ = writeln!(out, "{event}");
    }
    out
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use tokio::io::duplex;

    use super::*;
    use crate::endpoint::Endpoint;
    use crate::registry::{EventStatus, RegistryConfig};

    async fn body_text(response: Response<BoxBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn registry() -> (ConnectionRegistry, String) {
        let registry = ConnectionRegistry::new(RegistryConfig::default());
        let (local, _remote) = duplex(16);
        let id = registry.add(Endpoint::new(local, "db:5432"), "db:5432", "alice");
        registry.record_event(&id, EventStatus::Connect, "user=alice destination=db:5432");
        (registry, id)
    }

    #[tokio::test]
    async fn text_dump_lists_sessions_and_events() {
        let (registry, id) = registry();
        let text = body_text(render(&registry, &HashMap::new())).await;

        assert!(text.starts_with("Active sessions: 1\n"));
        assert!(text.contains(&format!("{id} => db:5432 user=alice")));
        assert!(text.contains(&format!("CONNECT {id} user=alice destination=db:5432")));
    }

    #[tokio::test]
    async fn json_dump() {
        let (registry, id) = registry();
        let params = HashMap::from([("format".to_owned(), "json".to_owned())]);
        let response = render(&registry, &params);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["connections"][0]["id"], id.as_str());
        assert_eq!(json["events"][0]["status"], "CONNECT");
    }
}
