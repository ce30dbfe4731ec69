use std::time::Duration;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{header, Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde_json::json;

use super::{EndpointHandler, SendContext};
use crate::collector::BuildError;
use crate::error::MetricsError;
use crate::reading::{MetricDefinition, MetricReading, RateKind};
use crate::writer::{
    write_json_reading, write_json_string, write_value, TimestampCache, WireFormat,
};

type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

fn build_client() -> Result<HttpsClient, BuildError> {
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|e| BuildError::Tls { reason: e.to_string() })?
        .https_or_http()
        .enable_http1()
        .build();

    Ok(Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(30))
        .build(https))
}

fn join_uri(base_url: &str, path: &str) -> Result<Uri, BuildError> {
    let joined = format!("{}{}", base_url.trim_end_matches('/'), path);
    joined
        .parse::<Uri>()
        .map_err(|e| BuildError::InvalidEndpointAddress { reason: format!("{joined}: {e}") })
}

/// Whether a non-2xx status is worth retrying.
///
/// Non-2xx responses are retryable in general; only client errors are final,
/// and even there 429 signals rate limiting rather than a bad payload.
fn status_is_transient(status: StatusCode) -> bool {
    !status.is_client_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// POSTs a JSON body, mapping the response onto the retry taxonomy: network
/// errors, timeouts, and non-2xx statuses are transient, except 4xx other
/// than 429, which drops the payload.
fn post_json(
    client: &HttpsClient,
    uri: &Uri,
    extra_headers: &[(&'static str, &str)],
    body: Bytes,
    cx: &SendContext<'_>,
) -> Result<(), MetricsError> {
    let transient = |reason: String| MetricsError::TransportTransient {
        endpoint: cx.endpoint().to_string(),
        reason,
    };

    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri.clone())
        .header(header::CONTENT_TYPE, "application/json");
    for (name, value) in extra_headers {
        builder = builder.header(*name, *value);
    }
    let request = builder.body(Full::from(body)).map_err(|e| MetricsError::TransportFatal {
        endpoint: cx.endpoint().to_string(),
        reason: e.to_string(),
    })?;

    let result = cx
        .runtime()
        .block_on(async { tokio::time::timeout(cx.timeout(), client.request(request)).await });

    match result {
        Err(_) => Err(transient(format!("request timed out after {:?}", cx.timeout()))),
        Ok(Err(e)) => Err(transient(e.to_string())),
        Ok(Ok(response)) => {
            let status = response.status();
            if status.is_success() {
                return Ok(());
            }

            let reason = status
                .canonical_reason()
                .map_or_else(|| status.as_u16().to_string(), str::to_string);
            if status_is_transient(status) {
                Err(transient(reason))
            } else {
                Err(MetricsError::TransportFatal {
                    endpoint: cx.endpoint().to_string(),
                    reason,
                })
            }
        }
    }
}

/// Bosun / OpenTSDB framing: a JSON array of
/// `{"metric","value","tags",{...},"timestamp"}` objects, timestamps in
/// milliseconds.
pub(crate) struct BosunFormat;

impl WireFormat for BosunFormat {
    fn open(&self, _section: usize, buf: &mut Vec<u8>) {
        buf.push(b'[');
    }

    fn separator(&self) -> &'static [u8] {
        b","
    }

    fn close(&self, _section: usize, buf: &mut Vec<u8>) {
        buf.push(b']');
    }

    fn encode_reading(
        &self,
        reading: &MetricReading,
        timestamps: &mut TimestampCache,
        buf: &mut Vec<u8>,
    ) {
        write_json_reading(reading, timestamps, buf);
    }
}

/// Ships readings to a Bosun server: data to `/api/put`, metadata to
/// `/api/metadata/put`.
pub struct BosunHandler {
    put_uri: Uri,
    metadata_uri: Uri,
    client: HttpsClient,
    format: BosunFormat,
}

impl BosunHandler {
    /// Creates a handler for the Bosun server at `base_url`
    /// (e.g. `https://bosun.example.com:8070`).
    pub fn new(base_url: &str) -> Result<BosunHandler, BuildError> {
        Ok(BosunHandler {
            put_uri: join_uri(base_url, "/api/put")?,
            metadata_uri: join_uri(base_url, "/api/metadata/put")?,
            client: build_client()?,
            format: BosunFormat,
        })
    }
}

fn bosun_rate(kind: RateKind) -> &'static str {
    match kind {
        RateKind::Counter | RateKind::CumulativeCounter => "counter",
        RateKind::Rate => "rate",
        RateKind::Gauge => "gauge",
    }
}

impl EndpointHandler for BosunHandler {
    fn wire_format(&self) -> &dyn WireFormat {
        &self.format
    }

    fn send_payload(&mut self, payload: &[u8], cx: &SendContext<'_>) -> Result<(), MetricsError> {
        post_json(&self.client, &self.put_uri, &[], Bytes::copy_from_slice(payload), cx)
    }

    fn send_metadata(
        &mut self,
        definitions: &[MetricDefinition],
        cx: &SendContext<'_>,
    ) -> Result<(), MetricsError> {
        let mut entries = Vec::with_capacity(definitions.len() * 3);
        for def in definitions {
            let name = def.name.as_ref();
            entries.push(json!({"Metric": name, "Name": "rate", "Value": bosun_rate(def.rate_kind)}));
            entries.push(json!({"Metric": name, "Name": "unit", "Value": def.unit}));
            entries.push(json!({"Metric": name, "Name": "desc", "Value": def.description}));
        }

        let body = serde_json::to_vec(&entries).map_err(|e| MetricsError::TransportFatal {
            endpoint: cx.endpoint().to_string(),
            reason: e.to_string(),
        })?;
        post_json(&self.client, &self.metadata_uri, &[], Bytes::from(body), cx)
    }
}

/// DataDog series framing: `{"series":[{"metric","points","type",...}]}` with
/// timestamps in epoch seconds and tags as `"key:value"` strings.
pub(crate) struct DataDogFormat;

impl WireFormat for DataDogFormat {
    fn open(&self, _section: usize, buf: &mut Vec<u8>) {
        buf.extend_from_slice(b"{\"series\":[");
    }

    fn separator(&self) -> &'static [u8] {
        b","
    }

    fn close(&self, _section: usize, buf: &mut Vec<u8>) {
        buf.extend_from_slice(b"]}");
    }

    fn encode_reading(
        &self,
        reading: &MetricReading,
        timestamps: &mut TimestampCache,
        buf: &mut Vec<u8>,
    ) {
        buf.extend_from_slice(b"{\"metric\":");
        let mut name = String::with_capacity(reading.name().len() + reading.suffix().len());
        name.push_str(reading.name());
        name.push_str(reading.suffix());
        write_json_string(&name, buf);

        buf.extend_from_slice(b",\"points\":[[");
        buf.extend_from_slice(timestamps.millis_str(reading.timestamp_millis() / 1000).as_bytes());
        buf.push(b',');
        write_value(reading.value(), buf);
        buf.extend_from_slice(b"]],\"type\":\"");
        let series_type = match reading.kind() {
            RateKind::Counter | RateKind::CumulativeCounter => "count",
            RateKind::Rate => "rate",
            RateKind::Gauge => "gauge",
        };
        buf.extend_from_slice(series_type.as_bytes());
        buf.push(b'"');

        // The conventional `host` default tag becomes the series host and is
        // lifted out of the tag list.
        let host = reading.tags().get("host");
        if let Some(host) = host {
            buf.extend_from_slice(b",\"host\":\"");
            buf.extend_from_slice(host.as_bytes());
            buf.push(b'"');
        }

        buf.extend_from_slice(b",\"tags\":[");
        let mut first = true;
        for (key, value) in reading.tags().pairs() {
            if host.is_some() && key == "host" {
                continue;
            }
            if !first {
                buf.push(b',');
            }
            first = false;
            buf.push(b'"');
            buf.extend_from_slice(key.as_bytes());
            buf.push(b':');
            buf.extend_from_slice(value.as_bytes());
            buf.push(b'"');
        }
        buf.extend_from_slice(b"]}");
    }

    fn prefers_deltas(&self) -> bool {
        true
    }
}

/// Ships readings to the DataDog series API.
pub struct DataDogHandler {
    series_uri: Uri,
    client: HttpsClient,
    format: DataDogFormat,
}

impl DataDogHandler {
    /// Creates a handler for the DataDog API at `base_url`
    /// (e.g. `https://app.datadoghq.com`), authenticated by `api_key`.
    pub fn new(base_url: &str, api_key: &str) -> Result<DataDogHandler, BuildError> {
        Ok(DataDogHandler {
            series_uri: join_uri(base_url, &format!("/api/v1/series?api_key={api_key}"))?,
            client: build_client()?,
            format: DataDogFormat,
        })
    }
}

impl EndpointHandler for DataDogHandler {
    fn wire_format(&self) -> &dyn WireFormat {
        &self.format
    }

    fn send_payload(&mut self, payload: &[u8], cx: &SendContext<'_>) -> Result<(), MetricsError> {
        post_json(&self.client, &self.series_uri, &[], Bytes::copy_from_slice(payload), cx)
    }
}

/// SignalFx datapoint framing: one body per rate kind, e.g.
/// `{"gauge":[{"metric","value","timestamp","dimensions":{...}}]}`.
pub(crate) struct SignalFxFormat;

const SIGNALFX_SECTIONS: [&[u8]; 3] = [b"{\"gauge\":[", b"{\"counter\":[", b"{\"cumulative_counter\":["];

impl WireFormat for SignalFxFormat {
    fn section_of(&self, reading: &MetricReading) -> usize {
        match reading.kind() {
            RateKind::Gauge => 0,
            RateKind::Counter | RateKind::Rate => 1,
            RateKind::CumulativeCounter => 2,
        }
    }

    fn open(&self, section: usize, buf: &mut Vec<u8>) {
        buf.extend_from_slice(SIGNALFX_SECTIONS[section]);
    }

    fn separator(&self) -> &'static [u8] {
        b","
    }

    fn close(&self, _section: usize, buf: &mut Vec<u8>) {
        buf.extend_from_slice(b"]}");
    }

    fn encode_reading(
        &self,
        reading: &MetricReading,
        timestamps: &mut TimestampCache,
        buf: &mut Vec<u8>,
    ) {
        buf.extend_from_slice(b"{\"metric\":");
        let mut name = String::with_capacity(reading.name().len() + reading.suffix().len());
        name.push_str(reading.name());
        name.push_str(reading.suffix());
        write_json_string(&name, buf);
        buf.extend_from_slice(b",\"value\":");
        write_value(reading.value(), buf);
        buf.extend_from_slice(b",\"timestamp\":");
        buf.extend_from_slice(timestamps.millis_str(reading.timestamp_millis()).as_bytes());
        buf.extend_from_slice(b",\"dimensions\":");
        buf.extend_from_slice(reading.tags().canonical().as_bytes());
        buf.push(b'}');
    }
}

/// Ships readings to the SignalFx datapoint API.
pub struct SignalFxHandler {
    datapoint_uri: Uri,
    access_token: Option<String>,
    client: HttpsClient,
    format: SignalFxFormat,
}

impl SignalFxHandler {
    /// Creates a handler for the SignalFx ingest API at `base_url`
    /// (e.g. `https://ingest.signalfx.com`).
    pub fn new(base_url: &str) -> Result<SignalFxHandler, BuildError> {
        Ok(SignalFxHandler {
            datapoint_uri: join_uri(base_url, "/v2/datapoint")?,
            access_token: None,
            client: build_client()?,
            format: SignalFxFormat,
        })
    }

    /// Sets the access token sent via the `X-SF-TOKEN` header.
    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> SignalFxHandler {
        self.access_token = Some(token.into());
        self
    }
}

impl EndpointHandler for SignalFxHandler {
    fn wire_format(&self) -> &dyn WireFormat {
        &self.format
    }

    fn send_payload(&mut self, payload: &[u8], cx: &SendContext<'_>) -> Result<(), MetricsError> {
        let headers: Vec<(&'static str, &str)> = match self.access_token.as_deref() {
            Some(token) => vec![("X-SF-TOKEN", token)],
            None => Vec::new(),
        };
        post_json(&self.client, &self.datapoint_uri, &headers, Bytes::copy_from_slice(payload), cx)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read as _, Write as _};
    use std::net::{SocketAddr, TcpListener};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, UNIX_EPOCH};

    use hyper::body::Bytes;
    use hyper::{StatusCode, Uri};
    use proptest::collection::vec as arb_vec;
    use proptest::prelude::*;

    use super::{
        build_client, post_json, status_is_transient, BosunFormat, DataDogFormat, SignalFxFormat,
    };
    use crate::endpoint::SendContext;
    use crate::error::MetricsError;
    use crate::payload::PayloadQueue;
    use crate::reading::{MetricReading, RateKind, MAX_TIMESTAMP_MS, MIN_TIMESTAMP_MS};
    use crate::tags::{default_name_transformer, resolve_tags, TagSet};
    use crate::writer::MetricWriter;

    fn reading(
        name: &str,
        suffix: &'static str,
        kind: RateKind,
        value: f64,
        tags: &[(&str, &str)],
        millis: u64,
    ) -> MetricReading {
        let declared: TagSet = tags.iter().map(|(k, v)| (*k, *v)).collect();
        let resolved =
            resolve_tags(&declared, &TagSet::new(), &default_name_transformer()).unwrap();
        MetricReading::new(
            Arc::from(name),
            suffix,
            kind,
            value,
            resolved,
            UNIX_EPOCH + Duration::from_millis(millis),
        )
        .unwrap()
    }

    fn render(format: &dyn crate::writer::WireFormat, readings: &[MetricReading]) -> Vec<String> {
        let queue = PayloadQueue::new(8192, 16);
        let mut writer = MetricWriter::new(&queue, format);
        for reading in readings {
            writer.write_reading(reading);
        }
        writer.finish();
        queue
            .take_for_flush()
            .into_iter()
            .map(|p| String::from_utf8(p.data.clone()).unwrap())
            .collect()
    }

    #[test]
    fn bosun_payload_shape() {
        let payloads = render(
            &BosunFormat,
            &[reading(
                "http.requests",
                "",
                RateKind::Counter,
                1000.0,
                &[("route", "/a"), ("host", "web1")],
                1_600_000_000_000,
            )],
        );

        assert_eq!(
            payloads,
            vec![concat!(
                r#"[{"metric":"http.requests","value":1000,"#,
                r#""tags":{"host":"web1","route":"/a"},"timestamp":1600000000000}]"#
            )
            .to_string()]
        );
    }

    #[test]
    fn datadog_payload_shape() {
        let payloads = render(
            &DataDogFormat,
            &[reading(
                "cpu.load",
                "_avg",
                RateKind::Gauge,
                0.5,
                &[("host", "web1"), ("core", "0")],
                1_600_000_000_000,
            )],
        );

        let parsed: serde_json::Value = serde_json::from_str(&payloads[0]).unwrap();
        let series = parsed["series"].as_array().unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0]["metric"], "cpu.load_avg");
        assert_eq!(series[0]["type"], "gauge");
        assert_eq!(series[0]["host"], "web1");
        assert_eq!(series[0]["points"][0][0], 1_600_000_000);
        assert_eq!(series[0]["points"][0][1], 0.5);
        assert_eq!(series[0]["tags"], serde_json::json!(["core:0"]));
    }

    #[test]
    fn signalfx_readings_split_by_kind() {
        let readings = [
            reading("a.gauge", "", RateKind::Gauge, 1.0, &[], 1_600_000_000_000),
            reading("a.counter", "", RateKind::Counter, 2.0, &[], 1_600_000_000_000),
            reading("a.total", "", RateKind::CumulativeCounter, 3.0, &[], 1_600_000_000_000),
        ];
        let payloads = render(&SignalFxFormat, &readings);

        assert_eq!(payloads.len(), 3);
        let gauge: serde_json::Value = serde_json::from_str(&payloads[0]).unwrap();
        assert_eq!(gauge["gauge"][0]["metric"], "a.gauge");
        let counter: serde_json::Value = serde_json::from_str(&payloads[1]).unwrap();
        assert_eq!(counter["counter"][0]["metric"], "a.counter");
        let cumulative: serde_json::Value = serde_json::from_str(&payloads[2]).unwrap();
        assert_eq!(cumulative["cumulative_counter"][0]["metric"], "a.total");
        assert_eq!(cumulative["cumulative_counter"][0]["timestamp"], 1_600_000_000_000u64);
    }

    #[test]
    fn status_classification() {
        let transient = [500, 502, 503, 429, 301, 302];
        for code in transient {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(status_is_transient(status), "{code} should be retryable");
        }

        let fatal = [400, 403, 404, 413];
        for code in fatal {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(!status_is_transient(status), "{code} should be fatal");
        }
    }

    /// Serves one canned HTTP response on a loopback listener.
    fn respond_with(response: &'static [u8]) -> (SocketAddr, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(response);
        });
        (addr, server)
    }

    fn post_to(addr: SocketAddr, timeout: Duration) -> Result<(), MetricsError> {
        let client = build_client().unwrap();
        let uri: Uri = format!("http://{addr}/api/put").parse().unwrap();
        let runtime =
            tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let cx = SendContext { endpoint: "test", runtime: &runtime, timeout };
        post_json(&client, &uri, &[], Bytes::from_static(b"[]"), &cx)
    }

    #[test]
    fn accepted_payload_succeeds() {
        let (addr, server) =
            respond_with(b"HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n");
        let result = post_to(addr, Duration::from_secs(5));
        server.join().unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn server_errors_and_rate_limiting_are_transient() {
        let responses: [&'static [u8]; 3] = [
            b"HTTP/1.1 500 Internal Server Error\r\nconnection: close\r\ncontent-length: 0\r\n\r\n",
            b"HTTP/1.1 429 Too Many Requests\r\nconnection: close\r\ncontent-length: 0\r\n\r\n",
            b"HTTP/1.1 302 Found\r\nconnection: close\r\ncontent-length: 0\r\n\r\n",
        ];

        for response in responses {
            let (addr, server) = respond_with(response);
            let result = post_to(addr, Duration::from_secs(5));
            server.join().unwrap();
            assert!(
                matches!(result, Err(MetricsError::TransportTransient { .. })),
                "expected a transient failure, got {:?}",
                result
            );
        }
    }

    #[test]
    fn client_errors_other_than_429_are_fatal() {
        let responses: [&'static [u8]; 2] = [
            b"HTTP/1.1 400 Bad Request\r\nconnection: close\r\ncontent-length: 0\r\n\r\n",
            b"HTTP/1.1 404 Not Found\r\nconnection: close\r\ncontent-length: 0\r\n\r\n",
        ];

        for response in responses {
            let (addr, server) = respond_with(response);
            let result = post_to(addr, Duration::from_secs(5));
            server.join().unwrap();
            assert!(
                matches!(result, Err(MetricsError::TransportFatal { .. })),
                "expected a fatal failure, got {:?}",
                result
            );
        }
    }

    #[test]
    fn unresponsive_server_times_out_as_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and read but never respond; exits once the client hangs up.
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            while let Ok(n) = stream.read(&mut buf) {
                if n == 0 {
                    break;
                }
            }
        });

        let result = post_to(addr, Duration::from_millis(200));
        assert!(
            matches!(result, Err(MetricsError::TransportTransient { .. })),
            "expected a timeout, got {:?}",
            result
        );
        server.join().unwrap();
    }

    fn arb_reading() -> impl Strategy<Value = MetricReading> {
        let name = "[a-z][a-z0-9._]{0,24}";
        let tag_key = "[a-z][a-z0-9_]{0,8}";
        let tag_value = "[a-zA-Z0-9_./-]{1,12}";
        let kind = prop_oneof![
            Just(RateKind::Counter),
            Just(RateKind::Gauge),
            Just(RateKind::CumulativeCounter),
            Just(RateKind::Rate),
        ];

        (
            name,
            kind,
            prop::num::f64::NORMAL | prop::num::f64::ZERO,
            arb_vec((tag_key, tag_value), 0..3),
            MIN_TIMESTAMP_MS..MAX_TIMESTAMP_MS,
        )
            .prop_map(|(name, kind, value, tags, millis)| {
                let mut declared = TagSet::new();
                let mut seen: Vec<String> = Vec::new();
                for (key, value) in tags {
                    if seen.contains(&key) {
                        continue;
                    }
                    seen.push(key.clone());
                    declared = declared.with(key, value);
                }
                let resolved =
                    resolve_tags(&declared, &TagSet::new(), &default_name_transformer()).unwrap();
                MetricReading::new(
                    Arc::from(name.as_str()),
                    "",
                    kind,
                    value,
                    resolved,
                    UNIX_EPOCH + Duration::from_millis(millis),
                )
                .unwrap()
            })
    }

    proptest! {
        #[test]
        fn bosun_payloads_always_parse(
            payload_limit in 256usize..8192,
            readings in arb_vec(arb_reading(), 1..64),
        ) {
            let queue = PayloadQueue::new(payload_limit, 1024);
            let format = BosunFormat;
            let mut writer = MetricWriter::new(&queue, &format);
            for reading in &readings {
                writer.write_reading(reading);
            }
            writer.finish();

            let written = writer.readings_written();
            let dropped = writer.readings_dropped();
            prop_assert_eq!(written + dropped, readings.len() as u64);

            let mut parsed_readings = 0u64;
            for payload in queue.take_for_flush() {
                prop_assert!(payload.used() <= payload_limit);
                let parsed: serde_json::Value =
                    serde_json::from_slice(&payload.data).expect("payload must be valid JSON");
                let entries = parsed.as_array().expect("payload must be a JSON array");
                prop_assert_eq!(entries.len() as u32, payload.metrics_count());
                parsed_readings += entries.len() as u64;
            }
            prop_assert_eq!(parsed_readings, written);
        }
    }
}
