//! End-to-end tests over real sockets: one single-worker server per test,
//! plain `TcpStream` clients (rustls client for the TLS round trip).

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mazurka::{Context, Outcome, Response, Router, Security, Server, ServerConfig, Threading};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn home(_ctx: Context) -> Outcome {
    Outcome::Respond(Response::ok("home sweet home"))
}

fn echo(ctx: Context) -> Outcome {
    Outcome::Respond(Response::ok(ctx.body().to_vec()))
}

fn killer(_ctx: Context) -> Outcome {
    Outcome::Respond(Response::kill())
}

fn deferred(ctx: Context) -> Outcome {
    let link = ctx.link.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        link.respond(Response::ok("deferred"));
    });
    Outcome::Spawned
}

fn router() -> Router {
    let mut r = Router::new();
    r.get("/", home);
    r.head("/probe", home);
    r.post("/echo", echo);
    r.get("/kill", killer);
    r.get("/deferred", deferred);
    r
}

fn start_server(
    router: Router,
    cfg: ServerConfig,
    port: u16,
) -> (Arc<AtomicBool>, thread::JoinHandle<()>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    let handle = thread::spawn(move || {
        Server::bind(&format!("127.0.0.1:{}", port))
            .config(cfg.threading(Threading::Single))
            .serve_until(router, flag)
            .expect("server failed");
    });
    wait_listening(port);
    (shutdown, handle)
}

fn wait_listening(port: u16) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(_) => return,
            Err(_) => {
                assert!(Instant::now() < deadline, "server did not start listening");
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read one full response: `(status, head text, body bytes)`.
fn read_response<R: Read>(r: &mut R) -> (u16, String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = r.read(&mut tmp).expect("read response head");
        assert!(n > 0, "connection closed before response head completed");
        buf.extend_from_slice(&tmp[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .expect("status line")
        .parse()
        .expect("status code");
    let content_length: usize = head
        .lines()
        .find_map(|line| {
            let (k, v) = line.split_once(':')?;
            if k.eq_ignore_ascii_case("content-length") {
                v.trim().parse().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);
    let mut body = buf[head_end..].to_vec();
    while body.len() < content_length {
        let n = r.read(&mut tmp).expect("read response body");
        assert!(n > 0, "connection closed mid body");
        body.extend_from_slice(&tmp[..n]);
    }
    body.truncate(content_length);
    (status, head, body)
}

/// One request over a fresh connection; `None` when the connection stalls or
/// drops (e.g. it raced into a dying worker's backlog).
fn try_request(port: u16, raw: &[u8]) -> Option<(u16, Vec<u8>)> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).ok()?;
    stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .ok()?;
    stream.write_all(raw).ok()?;
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        match stream.read(&mut tmp) {
            Ok(n) if n > 0 => buf.extend_from_slice(&tmp[..n]),
            _ => return None,
        }
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let status: u16 = head.split_whitespace().nth(1)?.parse().ok()?;
    let content_length: usize = head
        .lines()
        .find_map(|line| {
            let (k, v) = line.split_once(':')?;
            if k.eq_ignore_ascii_case("content-length") {
                v.trim().parse().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);
    let mut body = buf[head_end..].to_vec();
    while body.len() < content_length {
        match stream.read(&mut tmp) {
            Ok(n) if n > 0 => body.extend_from_slice(&tmp[..n]),
            _ => return None,
        }
    }
    body.truncate(content_length);
    Some((status, body))
}

#[test]
fn plain_get_single_chunk() {
    init_logs();
    let port = free_port();
    let (shutdown, handle) = start_server(router(), ServerConfig::default(), port);

    let mut stream = connect(port);
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (status, head, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert!(head.contains("Content-Length: 15"));
    assert_eq!(body, b"home sweet home");

    shutdown.store(true, Ordering::Release);
    let _ = handle.join();
}

#[test]
fn split_head_gets_the_same_response() {
    init_logs();
    let port = free_port();
    let (shutdown, handle) = start_server(router(), ServerConfig::default(), port);

    let mut stream = connect(port);
    stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n").unwrap();
    stream.flush().unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(b"\r\n").unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert_eq!(body, b"home sweet home");

    shutdown.store(true, Ordering::Release);
    let _ = handle.join();
}

#[test]
fn missing_host_is_rejected() {
    init_logs();
    let port = free_port();
    let (shutdown, handle) = start_server(router(), ServerConfig::default(), port);

    let mut stream = connect(port);
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, 400);
    assert_eq!(body, b"Missing \"Host\" Header");

    shutdown.store(true, Ordering::Release);
    let _ = handle.join();
}

#[test]
fn method_not_allowed_reports_allow() {
    init_logs();
    let port = free_port();
    let (shutdown, handle) = start_server(router(), ServerConfig::default(), port);

    let mut stream = connect(port);
    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n")
        .unwrap();
    let (status, head, _) = read_response(&mut stream);
    assert_eq!(status, 405);
    assert!(head.contains("Allow: GET"), "head was: {}", head);

    shutdown.store(true, Ordering::Release);
    let _ = handle.join();
}

#[test]
fn unknown_route_is_404() {
    init_logs();
    let port = free_port();
    let (shutdown, handle) = start_server(router(), ServerConfig::default(), port);

    let mut stream = connect(port);
    stream
        .write_all(b"GET /nope HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, 404);
    assert_eq!(body, b"404 Not Found");

    shutdown.store(true, Ordering::Release);
    let _ = handle.join();
}

#[test]
fn oversize_request_is_413() {
    init_logs();
    let port = free_port();
    let cfg = ServerConfig::default().request_max(512);
    let (shutdown, handle) = start_server(router(), cfg, port);

    let mut stream = connect(port);
    let huge = format!(
        "GET / HTTP/1.1\r\nHost: x\r\nX-Filler: {}\r\n\r\n",
        "f".repeat(4096)
    );
    stream.write_all(huge.as_bytes()).unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, 413);
    assert_eq!(body, b"413 Content Too Large");

    shutdown.store(true, Ordering::Release);
    let _ = handle.join();
}

#[test]
fn kill_stops_the_runtime() {
    init_logs();
    let port = free_port();
    let (_shutdown, handle) = start_server(router(), ServerConfig::default(), port);

    let mut stream = connect(port);
    stream
        .write_all(b"GET /kill HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    // No response is sent for a kill; the worker tears the connection down.
    let mut sink = [0u8; 64];
    let n = stream.read(&mut sink).unwrap_or(0);
    assert_eq!(n, 0, "kill must not produce a response");

    // The server exits on its own, without the shutdown flag.
    handle.join().expect("server thread ended cleanly");
}

// A kill is scoped to the worker that dispatched it: with several workers on
// the shared port, the survivors keep serving and the server stays up until
// the caller's shutdown flag.
#[test]
fn kill_stops_only_its_own_worker() {
    init_logs();
    let port = free_port();
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    let fleet_router = router();
    let handle = thread::spawn(move || {
        Server::bind(&format!("127.0.0.1:{}", port))
            .config(ServerConfig::default().threading(Threading::Count(3)))
            .serve_until(fleet_router, flag)
            .expect("server failed");
    });
    wait_listening(port);

    // Kill whichever worker accepts this connection.
    {
        let mut stream = connect(port);
        stream
            .write_all(b"GET /kill HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let mut sink = [0u8; 64];
        let _ = stream.read(&mut sink);
    }

    // The surviving workers keep answering. Connections that raced into the
    // dying worker's backlog may stall, so retry over fresh connections.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut successes = 0;
    while successes < 5 {
        assert!(
            Instant::now() < deadline,
            "surviving workers stopped serving after a kill"
        );
        if let Some((status, body)) = try_request(port, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n") {
            assert_eq!(status, 200);
            assert_eq!(body, b"home sweet home");
            successes += 1;
        }
    }
    assert!(
        !handle.is_finished(),
        "a kill must not bring down sibling workers"
    );

    shutdown.store(true, Ordering::Release);
    let _ = handle.join();
}

#[test]
fn body_split_across_writes_is_reassembled() {
    init_logs();
    let port = free_port();
    let (shutdown, handle) = start_server(router(), ServerConfig::default(), port);

    let mut stream = connect(port);
    stream
        .write_all(b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nhel")
        .unwrap();
    stream.flush().unwrap();
    thread::sleep(Duration::from_millis(30));
    stream.write_all(b"lo ").unwrap();
    stream.flush().unwrap();
    thread::sleep(Duration::from_millis(30));
    stream.write_all(b"world").unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert_eq!(body, b"hello world");

    shutdown.store(true, Ordering::Release);
    let _ = handle.join();
}

#[test]
fn head_response_advertises_but_suppresses_the_body() {
    init_logs();
    let port = free_port();
    let (shutdown, handle) = start_server(router(), ServerConfig::default(), port);

    let mut stream = connect(port);
    stream
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    stream
        .write_all(b"HEAD /probe HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let mut buf = Vec::new();
    let mut tmp = [0u8; 512];
    let head_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut tmp).expect("read response head");
        assert!(n > 0);
        buf.extend_from_slice(&tmp[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Length: 15"), "head was: {}", head);
    // The advertised body never arrives.
    assert_eq!(buf.len(), head_end);
    match stream.read(&mut tmp) {
        Ok(n) => assert_eq!(n, 0, "unexpected body bytes after HEAD response"),
        Err(_) => {} // timed out with nothing more to read
    }

    shutdown.store(true, Ordering::Release);
    let _ = handle.join();
}

#[test]
fn keep_alive_serves_sequential_requests() {
    init_logs();
    let port = free_port();
    let (shutdown, handle) = start_server(router(), ServerConfig::default(), port);

    let mut stream = connect(port);
    for _ in 0..3 {
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let (status, _, body) = read_response(&mut stream);
        assert_eq!(status, 200);
        assert_eq!(body, b"home sweet home");
    }

    shutdown.store(true, Ordering::Release);
    let _ = handle.join();
}

#[test]
fn large_response_is_sent_in_windows() {
    init_logs();
    fn big(_ctx: Context) -> Outcome {
        let mut payload = Vec::with_capacity(64 * 1024);
        for i in 0..64 * 1024 {
            payload.push(b'a' + (i % 23) as u8);
        }
        Outcome::Respond(Response::ok(payload))
    }
    let mut r = Router::new();
    r.get("/big", big);

    let port = free_port();
    // A small socket buffer forces many send windows.
    let cfg = ServerConfig::default().socket_buffer(512);
    let (shutdown, handle) = start_server(r, cfg, port);

    let mut stream = connect(port);
    stream
        .write_all(b"GET /big HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert_eq!(body.len(), 64 * 1024);
    for (i, b) in body.iter().enumerate() {
        assert_eq!(*b, b'a' + (i % 23) as u8, "corruption at offset {}", i);
    }

    shutdown.store(true, Ordering::Release);
    let _ = handle.join();
}

#[test]
fn spawned_handler_responds_through_the_link() {
    init_logs();
    let port = free_port();
    let (shutdown, handle) = start_server(router(), ServerConfig::default(), port);

    let mut stream = connect(port);
    stream
        .write_all(b"GET /deferred HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert_eq!(body, b"deferred");

    // The connection is live again afterwards.
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert_eq!(body, b"home sweet home");

    shutdown.store(true, Ordering::Release);
    let _ = handle.join();
}

#[cfg(feature = "tls")]
#[test]
fn tls_round_trip() {
    init_logs();
    let issued = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, issued.cert.pem()).unwrap();
    std::fs::write(&key_path, issued.key_pair.serialize_pem()).unwrap();

    let port = free_port();
    let cfg = ServerConfig::default()
        .socket_buffer(1024)
        .security(Security::tls(&cert_path, &key_path));
    let (shutdown, handle) = start_server(router(), cfg, port);

    let mut roots = rustls::RootCertStore::empty();
    roots.add(issued.cert.der().clone()).unwrap();
    let client_cfg = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let server_name = rustls::pki_types::ServerName::try_from("localhost".to_string()).unwrap();
    let mut conn = rustls::ClientConnection::new(Arc::new(client_cfg), server_name).unwrap();
    let mut sock = connect(port);
    let mut tls = rustls::Stream::new(&mut conn, &mut sock);

    // A body larger than the socket buffer exercises multi-window encrypts.
    let payload = vec![b'z'; 8 * 1024];
    let mut request = format!(
        "POST /echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
        payload.len()
    )
    .into_bytes();
    request.extend_from_slice(&payload);
    tls.write_all(&request).unwrap();

    let (status, _, body) = read_response(&mut tls);
    assert_eq!(status, 200);
    assert_eq!(body, payload);

    // Keep-alive under TLS.
    tls.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (status, _, body) = read_response(&mut tls);
    assert_eq!(status, 200);
    assert_eq!(body, b"home sweet home");

    shutdown.store(true, Ordering::Release);
    let _ = handle.join();
}
