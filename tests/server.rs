use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use corvid::connection::Upgraded;
use corvid::http::{Method, Request, Response};
use corvid::{App, Server, ShutdownHandle, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const BIG_BODY: usize = 2 * 1024 * 1024 + 123;

fn app() -> App {
    let mut app = App::new()
        .bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .port(0)
        .workers(2)
        .timeout(1)
        .server_name("corvid-test");

    app.route("/").unwrap().to(|| "index").unwrap();
    app.route("/page/<uint>").unwrap().to(|n: u64| format!("page:{n}")).unwrap();
    app.route("/dir/").unwrap().to(|| "dir").unwrap();
    app.route("/echo")
        .unwrap()
        .methods([Method::Post])
        .to(|req: &Request| req.body_str().into_owned())
        .unwrap();
    app.route("/big").unwrap().to(|| "x".repeat(BIG_BODY)).unwrap();
    app.route("/panic")
        .unwrap()
        .to(|| -> Response { panic!("handler failure") })
        .unwrap();
    app.route("/ws")
        .unwrap()
        .websocket(|_req: Request, io: Upgraded| {
            tokio::task::spawn_local(async move {
                let mut stream = io.stream;
                let _ = stream
                    .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: echo\r\nConnection: Upgrade\r\n\r\n")
                    .await;
                if !io.read_buf.is_empty() {
                    let _ = stream.write_all(&io.read_buf).await;
                }
                let mut buf = [0u8; 256];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        })
        .unwrap();
    app.catch_all(|req: &Request| format!("caught {} {}", req.method(), req.path()));
    app
}

async fn start(app: App) -> (SocketAddr, ShutdownHandle) {
    let server = Server::bind(app).await.unwrap();
    let addr = server.local_addr();
    let handle = server.shutdown_handle();
    tokio::spawn(server.run());
    (addr, handle)
}

struct Reply {
    head: String,
    body: Vec<u8>,
}

impl Reply {
    fn status(&self) -> u16 {
        self.head[9..12].parse().unwrap()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }
}

async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert_eq!(n, 1, "connection closed mid-head: {:?}", String::from_utf8_lossy(&head));
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

async fn read_reply(stream: &mut TcpStream) -> Reply {
    let head = timeout(Duration::from_secs(5), read_head(stream)).await.unwrap();
    let mut reply = Reply { head, body: Vec::new() };
    let len: usize = reply.header("content-length").map_or(0, |v| v.parse().unwrap());
    reply.body = vec![0; len];
    timeout(Duration::from_secs(5), stream.read_exact(&mut reply.body))
        .await
        .unwrap()
        .unwrap();
    reply
}

async fn request(addr: SocketAddr, raw: &str) -> Reply {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    read_reply(&mut stream).await
}

async fn assert_closed(stream: &mut TcpStream) {
    let mut rest = Vec::new();
    let n = timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .expect("connection was not closed")
        .unwrap_or(0);
    assert_eq!(n, 0, "unexpected bytes: {:?}", String::from_utf8_lossy(&rest));
}

#[tokio::test]
async fn typed_route_over_the_wire() {
    let (addr, _server) = start(app()).await;
    let reply = request(addr, "GET /page/3 HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    assert!(reply.head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(reply.header("content-length"), Some("6"));
    assert_eq!(reply.header("server"), Some("corvid-test"));
    assert!(reply.header("date").is_some_and(|d| d.ends_with("GMT")));
    assert_eq!(reply.body, b"page:3");
}

#[tokio::test]
async fn keep_alive_serves_sequential_requests() {
    let (addr, _server) = start(app()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    for n in [1, 2] {
        let req = format!("GET /page/{n} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(req.as_bytes()).await.unwrap();
        let reply = read_reply(&mut stream).await;
        assert_eq!(reply.body, format!("page:{n}").as_bytes());
        assert!(reply.header("connection").is_none());
    }
}

#[tokio::test]
async fn http_1_1_connection_close() {
    let (addr, _server) = start(app()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    assert_eq!(read_reply(&mut stream).await.body, b"index");
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn http_1_0_closes_after_one_response() {
    let (addr, _server) = start(app()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let reply = read_reply(&mut stream).await;
    assert_eq!(reply.status(), 200);
    assert!(reply.header("connection").is_none());
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn http_1_0_keep_alive_is_honoured() {
    let (addr, _server) = start(app()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    for _ in 0..2 {
        stream
            .write_all(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n")
            .await
            .unwrap();
        let reply = read_reply(&mut stream).await;
        assert_eq!(reply.header("connection"), Some("Keep-Alive"));
        assert_eq!(reply.body, b"index");
    }
}

#[tokio::test]
async fn idle_connection_is_closed_without_response() {
    let (addr, _server) = start(app()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let started = Instant::now();
    assert_closed(&mut stream).await;
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn deadline_is_rearmed_after_a_response() {
    let (addr, _server) = start(app()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
    let reply = read_reply(&mut stream).await;
    assert_eq!(reply.status(), 200);

    let answered = Instant::now();
    assert_closed(&mut stream).await;
    assert!(answered.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn partial_request_times_out() {
    let (addr, _server) = start(app()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\nHost: loc").await.unwrap();
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn missing_host_is_400() {
    let (addr, _server) = start(app()).await;
    let reply = request(addr, "GET / HTTP/1.1\r\n\r\n").await;
    assert_eq!(reply.status(), 400);
    assert_eq!(reply.body, b"Bad Request");
}

#[tokio::test]
async fn head_without_host_gets_400_head_only() {
    let (addr, _server) = start(app()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"HEAD / HTTP/1.1\r\n\r\n").await.unwrap();
    let head = timeout(Duration::from_secs(5), read_head(&mut stream)).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(head.contains("Content-Length: 11\r\n"));
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn expect_continue_gets_interim_response() {
    let (addr, _server) = start(app()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"POST /echo HTTP/1.1\r\nHost: localhost\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n")
        .await
        .unwrap();

    let interim = timeout(Duration::from_secs(5), read_head(&mut stream)).await.unwrap();
    assert_eq!(interim, "HTTP/1.1 100 Continue\r\n\r\n");

    stream.write_all(b"hello").await.unwrap();
    let reply = read_reply(&mut stream).await;
    assert_eq!(reply.status(), 200);
    assert_eq!(reply.body, b"hello");
}

#[tokio::test]
async fn pipelined_requests_are_answered_in_order() {
    let (addr, _server) = start(app()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /page/1 HTTP/1.1\r\nHost: a\r\n\r\n\
              POST /echo HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\n\r\nbody\
              GET /page/2 HTTP/1.1\r\nHost: a\r\n\r\n",
        )
        .await
        .unwrap();

    assert_eq!(read_reply(&mut stream).await.body, b"page:1");
    assert_eq!(read_reply(&mut stream).await.body, b"body");
    assert_eq!(read_reply(&mut stream).await.body, b"page:2");
}

#[tokio::test]
async fn chunked_request_body() {
    let (addr, _server) = start(app()).await;
    let reply = request(
        addr,
        "POST /echo HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n",
    )
    .await;
    assert_eq!(reply.body, b"abcde");
}

#[tokio::test]
async fn catch_all_takes_unrouted_requests() {
    let (addr, _server) = start(app()).await;
    let reply = request(addr, "POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 0\r\n\r\n").await;
    assert_eq!(reply.status(), 200);
    assert_eq!(reply.body, b"caught POST /x");
}

#[tokio::test]
async fn wrong_method_is_405() {
    let (addr, _server) = start(app()).await;
    let reply = request(addr, "DELETE /page/1 HTTP/1.1\r\nHost: a\r\n\r\n").await;
    assert_eq!(reply.status(), 405);
}

#[tokio::test]
async fn missing_trailing_slash_redirects() {
    let (addr, _server) = start(app()).await;
    let reply = request(addr, "GET /dir HTTP/1.1\r\nHost: localhost:8080\r\n\r\n").await;
    assert_eq!(reply.status(), 301);
    assert_eq!(reply.header("location"), Some("http://localhost:8080/dir/"));
}

#[tokio::test]
async fn options_lists_methods() {
    let (addr, _server) = start(app()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"OPTIONS /echo HTTP/1.1\r\nHost: a\r\n\r\n")
        .await
        .unwrap();
    let head = timeout(Duration::from_secs(5), read_head(&mut stream)).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 204 No Content\r\n"));
    assert!(head.contains("Allow: OPTIONS, HEAD, POST\r\n"));
    assert!(!head.contains("Content-Length"));
}

#[tokio::test]
async fn head_sends_length_without_body() {
    let (addr, _server) = start(app()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"HEAD /page/3 HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();
    let raw = String::from_utf8(raw).unwrap();
    assert!(raw.contains("Content-Length: 6\r\n"));
    assert!(raw.ends_with("\r\n\r\n"));
}

#[tokio::test]
async fn panicking_handler_yields_500_and_keeps_serving() {
    let (addr, _server) = start(app()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET /panic HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
    assert_eq!(read_reply(&mut stream).await.status(), 500);

    stream.write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
    assert_eq!(read_reply(&mut stream).await.body, b"index");
}

#[tokio::test]
async fn large_body_is_written_in_full() {
    let (addr, _server) = start(app()).await;
    let reply = request(addr, "GET /big HTTP/1.1\r\nHost: a\r\n\r\n").await;
    assert_eq!(reply.body.len(), BIG_BODY);
    assert!(reply.body.iter().all(|b| *b == b'x'));
}

#[tokio::test]
async fn malformed_request_closes_without_response() {
    let (addr, _server) = start(app()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"\x00\x01 garbage\r\n\r\n").await.unwrap();
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn upgrade_hands_over_the_socket() {
    let (addr, _server) = start(app()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /ws HTTP/1.1\r\nHost: a\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\nearly")
        .await
        .unwrap();
    let head = timeout(Duration::from_secs(5), read_head(&mut stream)).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));

    let mut early = [0u8; 5];
    stream.read_exact(&mut early).await.unwrap();
    assert_eq!(&early, b"early");

    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn upgrade_to_plain_route_is_404() {
    let (addr, _server) = start(app()).await;
    let reply = request(
        addr,
        "GET /page/1 HTTP/1.1\r\nHost: a\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n",
    )
    .await;
    assert_eq!(reply.status(), StatusCode::NotFound.as_u16());
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let (addr, server) = start(app()).await;
    assert_eq!(request(addr, "GET / HTTP/1.1\r\nHost: a\r\n\r\n").await.body, b"index");

    server.shutdown();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let refused = timeout(Duration::from_secs(2), TcpStream::connect(addr)).await;
    match refused {
        Ok(Ok(mut stream)) => {
            // The listener may linger in the accept backlog; nothing answers.
            let _ = stream.write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").await;
            let mut buf = Vec::new();
            let n = timeout(Duration::from_secs(2), stream.read_to_end(&mut buf))
                .await
                .map(|r| r.unwrap_or(0))
                .unwrap_or(0);
            assert_eq!(n, 0);
        }
        Ok(Err(_)) | Err(_) => {}
    }
}
