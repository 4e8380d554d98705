use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::NaiveDate;

use fiscal_xml_sync::domain::{Cnpj, DocumentCategory};
use fiscal_xml_sync::error::SyncError;
use fiscal_xml_sync::source::{
    DocumentPage, DocumentSource, PAGE_SIZE, PageRequest, RetryPolicy, SiegHttpClient,
};

struct StubServer {
    url: String,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl StubServer {
    fn start(status: u16, body: String) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let (served_hits, served_requests) = (Arc::clone(&hits), Arc::clone(&requests));
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let request = read_request(&mut stream);
                served_hits.fetch_add(1, Ordering::SeqCst);
                served_requests.lock().unwrap().push(request);
                let response = format!(
                    "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.flush();
            }
        });
        Self {
            url,
            hits,
            requests,
        }
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

fn read_request(stream: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let read = stream.read(&mut buf).unwrap_or(0);
        if read == 0 {
            break;
        }
        data.extend_from_slice(&buf[..read]);
        if let Some(end) = data.windows(4).position(|window| window == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&data[..end]).to_string();
            let length = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if name.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            if data.len() >= end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&data).to_string()
}

fn client(url: &str, attempts: u32) -> SiegHttpClient {
    SiegHttpClient::new(
        url,
        Duration::from_secs(5),
        RetryPolicy {
            attempts,
            delay: Duration::ZERO,
        },
    )
    .unwrap()
}

fn fetch(client: &SiegHttpClient, offset: usize) -> Result<DocumentPage, SyncError> {
    let cnpj: Cnpj = "11222333000181".parse().unwrap();
    client.fetch(&PageRequest {
        credential: "abc%2Fdef",
        cnpj: &cnpj,
        date: NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(),
        category: DocumentCategory::Nfe,
        offset,
    })
}

#[test]
fn server_errors_are_retried_until_exhausted() {
    let server = StubServer::start(500, r#"{"error":"boom"}"#.to_string());
    let result = fetch(&client(&server.url, 5), 0);
    assert_matches!(
        result,
        Err(SyncError::SourceExhausted { attempts: 5, last_error }) if last_error.contains("500")
    );
    assert_eq!(server.hits(), 5);
}

#[test]
fn not_found_marker_is_an_empty_page() {
    let server = StubServer::start(
        404,
        r#"["Nenhum arquivo XML localizado para os filtros informados"]"#.to_string(),
    );
    let page = fetch(&client(&server.url, 5), 0).unwrap();
    assert!(page.documents.is_empty());
    assert!(!page.has_more);
    assert_eq!(server.hits(), 1);
}

#[test]
fn other_not_found_bodies_are_retried() {
    let server = StubServer::start(404, r#"["Rota inexistente"]"#.to_string());
    assert_matches!(
        fetch(&client(&server.url, 3), 0),
        Err(SyncError::SourceExhausted { attempts: 3, .. })
    );
    assert_eq!(server.hits(), 3);
}

#[test]
fn malformed_json_is_retried() {
    let server = StubServer::start(200, "<html>gateway</html>".to_string());
    assert_matches!(
        fetch(&client(&server.url, 2), 0),
        Err(SyncError::SourceExhausted { attempts: 2, last_error }) if last_error.contains("malformed")
    );
    assert_eq!(server.hits(), 2);
}

#[test]
fn documents_and_request_shape() {
    let server = StubServer::start(200, r#"{"xmls":["PGEvPg=="]}"#.to_string());
    let page = fetch(&client(&server.url, 5), 50).unwrap();
    assert_eq!(page.documents.len(), 1);
    assert_eq!(page.documents[0].encoded, "PGEvPg==");
    assert!(!page.has_more);

    let requests = server.requests.lock().unwrap();
    let request = &requests[0];
    assert!(request.starts_with("POST /BaixarXmlsV2?api_key=abc%2Fdef "));
    for field in [
        r#""XmlType":1"#,
        r#""Take":50"#,
        r#""Skip":50"#,
        r#""DataEmissaoInicio":"2024-03-10""#,
        r#""DataEmissaoFim":"2024-03-10""#,
        r#""CnpjEmit":"11222333000181""#,
        r#""Downloadevent":false"#,
    ] {
        assert!(request.contains(field), "missing {field} in {request}");
    }
}

#[test]
fn full_page_asks_for_more() {
    let items = vec![r#""PGEvPg==""#; PAGE_SIZE].join(",");
    let server = StubServer::start(200, format!(r#"{{"xmls":[{items}]}}"#));
    let page = fetch(&client(&server.url, 1), 0).unwrap();
    assert_eq!(page.documents.len(), PAGE_SIZE);
    assert!(page.has_more);
}

#[test]
fn unreachable_host_is_retried() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    assert_matches!(
        fetch(&client(&url, 2), 0),
        Err(SyncError::SourceExhausted { attempts: 2, .. })
    );
}
