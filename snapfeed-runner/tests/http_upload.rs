//! Integration tests for the HTTP upload sink against a loopback responder.
//!
//! The responder accepts one connection per scripted response, records the
//! request line, headers and body, and replies with the scripted status,
//! extra headers and body.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use snapfeed_runner::{Credentials, HttpUploadSink, UploadError, UploadSink};

#[derive(Debug, Clone)]
struct SeenRequest {
    line: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

struct Responder {
    base_url: String,
    requests: Arc<Mutex<Vec<SeenRequest>>>,
    handle: JoinHandle<()>,
}

struct Scripted {
    status: &'static str,
    headers: &'static str,
    body: &'static str,
}

fn reply(status: &'static str, headers: &'static str, body: &'static str) -> Scripted {
    Scripted {
        status,
        headers,
        body,
    }
}

fn serve(responses: Vec<Scripted>) -> Responder {
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener bind should succeed");
    let addr = listener.local_addr().expect("local addr should resolve");
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&requests);

    let handle = std::thread::spawn(move || {
        for scripted in responses {
            let (mut stream, _) = listener.accept().expect("accept should succeed");
            let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));

            let mut line = String::new();
            reader.read_line(&mut line).expect("read request line");
            let mut headers = HashMap::new();
            loop {
                let mut header = String::new();
                reader.read_line(&mut header).expect("read header");
                if header == "\r\n" || header.is_empty() {
                    break;
                }
                if let Some((name, value)) = header.split_once(':') {
                    headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
                }
            }
            let len: usize = headers
                .get("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let mut body = vec![0; len];
            reader.read_exact(&mut body).expect("read body");
            seen.lock().unwrap().push(SeenRequest {
                line: line.trim_end().to_string(),
                headers,
                body,
            });

            let response = format!(
                "HTTP/1.1 {}\r\n{}content-length: {}\r\nconnection: close\r\n\r\n{}",
                scripted.status,
                scripted.headers,
                scripted.body.len(),
                scripted.body
            );
            stream.write_all(response.as_bytes()).expect("write response");
            stream.flush().expect("flush response");
        }
    });

    Responder {
        base_url: format!("http://{addr}/archives/"),
        requests,
        handle,
    }
}

fn sink_for(url: &str) -> HttpUploadSink {
    let credentials = Credentials::parse("uploader_pa_ss").unwrap();
    HttpUploadSink::new(url, credentials, Duration::from_secs(5)).unwrap()
}

fn archive_file(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("21-04-2025.json.zst");
    fs::write(&path, b"compressed-bytes").unwrap();
    path
}

#[test]
fn puts_file_to_url_with_basic_auth_and_json_link() {
    let server = serve(vec![reply(
        "201 Created",
        "content-type: application/json\r\nlocation: https://files.example/by-location\r\n",
        r#"{"link":"https://files.example/share/abc"}"#,
    )]);
    let dir = tempfile::tempdir().unwrap();
    let path = archive_file(&dir);

    let link = sink_for(&server.base_url).upload(&path).unwrap();
    server.handle.join().unwrap();

    assert_eq!(link, "https://files.example/share/abc");
    let requests = server.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let req = &requests[0];
    assert_eq!(req.line, "PUT /archives/21-04-2025.json.zst HTTP/1.1");
    assert_eq!(
        req.headers.get("authorization").map(String::as_str),
        Some("Basic dXBsb2FkZXI6cGFfc3M=")
    );
    assert_eq!(
        req.headers.get("content-type").map(String::as_str),
        Some("application/zstd")
    );
    assert_eq!(req.body, b"compressed-bytes");
}

#[test]
fn location_header_is_used_without_a_json_link() {
    let server = serve(vec![reply(
        "201 Created",
        "location: https://files.example/by-location\r\n",
        "",
    )]);
    let dir = tempfile::tempdir().unwrap();

    let link = sink_for(&server.base_url).upload(&archive_file(&dir)).unwrap();
    server.handle.join().unwrap();

    assert_eq!(link, "https://files.example/by-location");
}

#[test]
fn request_url_is_the_link_when_response_names_none() {
    let server = serve(vec![reply(
        "200 OK",
        "content-type: application/json\r\n",
        r#"{"stored":true}"#,
    )]);
    let dir = tempfile::tempdir().unwrap();

    let link = sink_for(&server.base_url).upload(&archive_file(&dir)).unwrap();
    server.handle.join().unwrap();

    assert_eq!(link, format!("{}21-04-2025.json.zst", server.base_url));
}

#[test]
fn client_and_server_errors_are_rejected() {
    let server = serve(vec![
        reply("403 Forbidden", "", "nope"),
        reply("500 Internal Server Error", "", ""),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let path = archive_file(&dir);
    let sink = sink_for(&server.base_url);

    let forbidden = sink.upload(&path).unwrap_err();
    let failed = sink.upload(&path).unwrap_err();
    server.handle.join().unwrap();

    assert!(
        matches!(&forbidden, UploadError::Rejected(msg) if msg.contains("403")),
        "got {forbidden:?}"
    );
    assert!(
        matches!(&failed, UploadError::Rejected(msg) if msg.contains("500")),
        "got {failed:?}"
    );
}

#[test]
fn unreachable_service_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let dir = tempfile::tempdir().unwrap();

    let err = sink_for(&format!("http://{addr}/archives"))
        .upload(&archive_file(&dir))
        .unwrap_err();

    assert!(matches!(err, UploadError::Transport(_)), "got {err:?}");
}
