use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crowdwatch_edge::config::UplinkSettings;
use crowdwatch_edge::uplink::codec::{self, PayloadEncoding};
use crowdwatch_edge::uplink::{HttpTransport, InMemorySpool, SpoolReason, UplinkClient};
use crowdwatch_edge::{CrowdSnapshot, DensityBucket, EdgeConfig, Trend};

struct Received {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

/// Answers one request per connection with the next status in `statuses`.
fn fake_server(statuses: Vec<u16>) -> Result<(String, JoinHandle<Vec<Received>>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let handle = thread::spawn(move || {
        let mut received = Vec::new();
        for status in statuses {
            let Ok((stream, _)) = listener.accept() else {
                break;
            };
            match serve_one(stream, status) {
                Ok(request) => received.push(request),
                Err(_) => break,
            }
        }
        received
    });
    Ok((format!("http://{}", addr), handle))
}

fn serve_one(stream: TcpStream, status: u16) -> Result<Received> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("empty request"))?.to_string();
    let path = parts.next().ok_or_else(|| anyhow!("no path"))?.to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let length: usize = headers
        .get("content-length")
        .map(|v| v.parse())
        .transpose()?
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;

    let mut stream = stream;
    write!(
        stream,
        "HTTP/1.1 {} Scripted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status
    )?;
    stream.flush()?;

    Ok(Received {
        method,
        path,
        headers,
        body,
    })
}

fn settings(server_url: &str) -> UplinkSettings {
    let mut settings = EdgeConfig::default().uplink;
    settings.server_url = server_url.to_string();
    settings.request_timeout = Duration::from_secs(5);
    settings.backoff_base = Duration::from_millis(5);
    settings.backoff_max = Duration::from_millis(20);
    settings.backoff_jitter = false;
    settings
}

fn snapshot(seq: u64) -> CrowdSnapshot {
    CrowdSnapshot {
        source_id: "plaza".into(),
        seq,
        timestamp: 1_700_000_000_000,
        count: 11,
        density: DensityBucket::Medium,
        trend: Some(Trend::Rising),
        anomaly: true,
        processing_ms: 27,
        detections: Vec::new(),
    }
}

#[test]
fn retries_server_errors_until_accepted() -> Result<()> {
    let (base, server) = fake_server(vec![500, 500, 200])?;
    let url = format!("{}/receive_data", base);
    let settings = settings(&url);
    let client = UplinkClient::spawn(
        &settings,
        "plaza-north",
        Box::new(HttpTransport::new(url.clone(), settings.request_timeout)),
        Box::new(InMemorySpool::new(4)),
        None,
    )?;
    client.submit(snapshot(42))?;
    let summary = client.shutdown()?;
    let requests = server.join().map_err(|_| anyhow!("server thread panicked"))?;

    assert_eq!(summary.delivered, 1);
    assert_eq!(summary.retries, 2);
    assert_eq!(requests.len(), 3);
    for (i, request) in requests.iter().enumerate() {
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/receive_data");
        assert_eq!(request.headers["x-device-id"], "plaza-north");
        assert_eq!(request.headers["x-payload-encoding"], "zlib");
        assert_eq!(request.headers["x-schema-version"], "1");
        assert_eq!(request.headers["content-type"], "application/json");
        assert_eq!(request.headers["x-attempt"], (i + 1).to_string());
    }
    let decoded = codec::decode(&requests[2].body, PayloadEncoding::Zlib)?;
    assert_eq!(decoded, snapshot(42));
    Ok(())
}

#[test]
fn client_error_goes_straight_to_spool() -> Result<()> {
    let (base, server) = fake_server(vec![400])?;
    let mut settings = settings(&base);
    settings.compression_enabled = false;
    let client = UplinkClient::spawn(
        &settings,
        "plaza-north",
        Box::new(HttpTransport::new(base.clone(), settings.request_timeout)),
        Box::new(InMemorySpool::new(4)),
        None,
    )?;
    client.submit(snapshot(1))?;
    let (summary, spool) = client.shutdown_with_spool()?;
    let requests = server.join().map_err(|_| anyhow!("server thread panicked"))?;

    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].headers["x-payload-encoding"], "identity");
    assert_eq!(summary.spooled, 1);
    let entries = spool.entries()?;
    assert_eq!(entries[0].reason, SpoolReason::Rejected);
    assert_eq!(entries[0].last_error.as_deref(), Some("HTTP 400"));
    assert_eq!(
        codec::decode(&entries[0].payload, entries[0].encoding)?,
        snapshot(1)
    );
    Ok(())
}

#[test]
fn unreachable_server_exhausts_retries() -> Result<()> {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?.port()
    };
    let url = format!("http://127.0.0.1:{}/receive_data", port);
    let mut settings = settings(&url);
    settings.max_uplink_retries = 2;
    let client = UplinkClient::spawn(
        &settings,
        "plaza-north",
        Box::new(HttpTransport::new(url.clone(), settings.request_timeout)),
        Box::new(InMemorySpool::new(4)),
        None,
    )?;
    client.submit(snapshot(9))?;
    let (summary, spool) = client.shutdown_with_spool()?;

    assert_eq!(summary.delivered, 0);
    let entries = spool.entries()?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, SpoolReason::Exhausted);
    assert_eq!(entries[0].attempts, 2);
    Ok(())
}

#[test]
fn health_probe_reports_status() -> Result<()> {
    let (base, server) = fake_server(vec![204])?;
    let probe_url = format!("{}/ping", base);
    let transport = HttpTransport::new(base.clone(), Duration::from_secs(5));
    assert_eq!(transport.probe(&probe_url)?, 204);
    let requests = server.join().map_err(|_| anyhow!("server thread panicked"))?;
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/ping");
    Ok(())
}
