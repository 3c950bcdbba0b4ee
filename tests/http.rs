#[cfg(feature = "tcp")]
mod tests {
    use std::{
        io::{Read, Write},
        net::{TcpListener, TcpStream},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    };

    use http::StatusCode;
    use nbhttp::{
        config::{ClientConfig, ProxyConfig, RedirectMode, ServerConfig},
        error::HttpError,
        handler::handler_fn,
        http::HttpClient,
        message::{Request, Response, ResponseHeader},
        server::{HttpServer, ServerHandle},
        sse::{event_stream_header, Event, EventParser, EventSink},
    };

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn start(server: HttpServer) -> (ServerHandle, String) {
        let handle = server.start().unwrap();
        let base = format!("http://{}", handle.local_addr());
        init_logging();
        (handle, base)
    }

    fn read_head(stream: &mut TcpStream) -> String {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    /// A server that drops the first `failures` connections after reading the request.
    fn flaky_server(failures: usize) -> (String, Arc<AtomicUsize>, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        let server = thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream = stream.unwrap();
                read_head(&mut stream);
                if counter.fetch_add(1, Ordering::SeqCst) < failures {
                    continue;
                }
                stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                    .unwrap();
                break;
            }
        });
        (base, accepted, server)
    }

    /// A proxy that answers one `CONNECT` with `answer` and returns the request head and the
    /// first byte sent through the tunnel.
    fn fake_proxy(answer: &'static [u8]) -> (u16, JoinHandle<(String, Option<u8>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let proxy = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let head = read_head(&mut stream);
            stream.write_all(answer).unwrap();
            let mut byte = [0u8; 1];
            let first = stream.read_exact(&mut byte).ok().map(|_| byte[0]);
            (head, first)
        });
        (port, proxy)
    }

    fn wait_for(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn echo_server() -> HttpServer {
        HttpServer::bind("127.0.0.1:0")
            .unwrap()
            .route(
                "/conn",
                handler_fn(|exchange| {
                    let id = exchange.connection().id().to_string();
                    exchange.send(Response::text(200, &id))
                }),
            )
            .route(
                "/echo",
                handler_fn(|exchange| {
                    let body = exchange.request().body().as_text().unwrap_or("").to_owned();
                    let text = format!("{} {}", exchange.request().method(), body);
                    exchange.send(Response::text(200, &text))
                }),
            )
    }

    #[test]
    fn test_get_reuses_pooled_connection() {
        let (server, base) = start(echo_server());
        let client = HttpClient::new().unwrap();

        let first = client.call(Request::get(format!("{base}/conn"))).unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        wait_for(|| client.idle_connections() == 1);
        let second = client.call(Request::get(format!("{base}/conn"))).unwrap();
        assert_eq!(first.body().as_text(), second.body().as_text());

        let missing = client.call(Request::get(format!("{base}/nothing"))).unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        client.close();
        server.stop();
    }

    #[test]
    fn test_post_body() {
        let (server, base) = start(echo_server());
        let client = HttpClient::new().unwrap();

        let response = client
            .call(Request::post(format!("{base}/echo"), "hello server"))
            .unwrap();
        assert_eq!(response.body().as_text(), Some("POST hello server"));

        server.stop();
    }

    #[test]
    fn test_server_closes_after_max_transactions() {
        let server = echo_server()
            .with_config(ServerConfig::default().with_max_transactions(Some(1)));
        let (server, base) = start(server);
        let client = HttpClient::new().unwrap();

        let first = client.call(Request::get(format!("{base}/conn"))).unwrap();
        assert_eq!(first.headers().get("Connection"), Some("close"));
        let second = client.call(Request::get(format!("{base}/conn"))).unwrap();
        assert_ne!(first.body().as_text(), second.body().as_text());

        server.stop();
    }

    #[test]
    fn test_redirect_is_followed() {
        let server = HttpServer::bind("127.0.0.1:0")
            .unwrap()
            .route(
                "/old",
                handler_fn(|exchange| {
                    exchange.send(Response::text(302, "moved").with_header("Location", "/new")?)
                }),
            )
            .route(
                "/new",
                handler_fn(|exchange| exchange.send(Response::text(200, "arrived"))),
            );
        let (server, base) = start(server);

        let client = HttpClient::with_config(
            ClientConfig::default().with_redirect_mode(RedirectMode::SafeMethods),
        )
        .unwrap();
        let response = client.call(Request::get(format!("{base}/old"))).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_text(), Some("arrived"));

        let manual =
            HttpClient::with_config(ClientConfig::default().with_redirect_mode(RedirectMode::Off))
                .unwrap();
        let response = manual.call(Request::get(format!("{base}/old"))).unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get("Location"), Some("/new"));

        server.stop();
    }

    #[test]
    fn test_cookies_are_stored_and_sent() {
        let server = HttpServer::bind("127.0.0.1:0")
            .unwrap()
            .route(
                "/login",
                handler_fn(|exchange| {
                    exchange.send(
                        Response::text(200, "welcome")
                            .with_header("Set-Cookie", "sid=abc123; Path=/")?,
                    )
                }),
            )
            .route(
                "/whoami",
                handler_fn(|exchange| {
                    let cookie = exchange
                        .request()
                        .headers()
                        .get("Cookie")
                        .unwrap_or("none")
                        .to_owned();
                    exchange.send(Response::text(200, &cookie))
                }),
            );
        let (server, base) = start(server);

        let client =
            HttpClient::with_config(ClientConfig::default().with_auto_cookies(true)).unwrap();
        let before = client.call(Request::get(format!("{base}/whoami"))).unwrap();
        assert_eq!(before.body().as_text(), Some("none"));
        client.call(Request::get(format!("{base}/login"))).unwrap();
        assert_eq!(client.cookies().map(|x| x.len()), Some(1));
        let after = client.call(Request::get(format!("{base}/whoami"))).unwrap();
        assert_eq!(after.body().as_text(), Some("sid=abc123"));

        server.stop();
    }

    #[test]
    fn test_max_active_connections_exceeded() {
        let server = HttpServer::bind("127.0.0.1:0").unwrap().with_handler(handler_fn(
            |exchange| {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(300));
                    let _ = exchange.send(Response::text(200, "slow"));
                });
                Ok(())
            },
        ));
        let (server, base) = start(server);

        let client =
            HttpClient::with_config(ClientConfig::default().with_max_active(Some(1))).unwrap();
        let slow = client.send_future(Request::get(format!("{base}/slow"))).unwrap();
        match client.send_future(Request::get(format!("{base}/slow"))) {
            Err(HttpError::MaxConnectionsExceeded(_)) => {}
            other => panic!("expected MaxConnectionsExceeded, got {other:?}"),
        }
        let response = slow.get(Duration::from_secs(5)).unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        server.stop();
    }

    #[test]
    fn test_chunked_streaming_response() {
        let server = HttpServer::bind("127.0.0.1:0").unwrap().with_handler(handler_fn(
            |exchange| {
                let sink = exchange.send_header(ResponseHeader::new(StatusCode::OK), None)?;
                thread::spawn(move || {
                    for part in ["one ", "two ", "three"] {
                        sink.write_str(part).unwrap();
                        thread::sleep(Duration::from_millis(10));
                    }
                    sink.close().unwrap();
                });
                Ok(())
            },
        ));
        let (server, base) = start(server);
        let client = HttpClient::new().unwrap();

        let response = client.call(Request::get(format!("{base}/stream"))).unwrap();
        assert_eq!(response.headers().get("Transfer-Encoding"), Some("chunked"));
        assert_eq!(response.body().as_text(), Some("one two three"));

        server.stop();
    }

    #[test]
    fn test_server_sent_events() {
        let server = HttpServer::bind("127.0.0.1:0").unwrap().with_handler(handler_fn(
            |exchange| {
                let events = EventSink::new(exchange.send_header(event_stream_header()?, None)?);
                events.send(&Event::new("first").with_id("1"))?;
                events.send(&Event::new("second").with_id("2"))?;
                events.close()
            },
        ));
        let (server, base) = start(server);
        let client = HttpClient::new().unwrap();

        let response = client.call(Request::get(format!("{base}/events"))).unwrap();
        let mut parser = EventParser::new();
        let events = parser.feed(response.body().as_bytes().unwrap_or_default());
        assert_eq!(
            events,
            vec![
                Event::new("first").with_id("1"),
                Event::new("second").with_id("2")
            ]
        );
        assert_eq!(parser.last_event_id(), Some("2"));

        server.stop();
    }

    #[test]
    fn test_retryable_status_is_retried() {
        let answered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&answered);
        let server = HttpServer::bind("127.0.0.1:0").unwrap().with_handler(handler_fn(
            move |exchange| match counter.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => exchange.send(Response::text(503, "busy")),
                _ => exchange.send(Response::text(200, "done")),
            },
        ));
        let (server, base) = start(server);

        let client = HttpClient::with_config(ClientConfig::default().with_max_retries(2)).unwrap();
        let response = client.call(Request::get(format!("{base}/work"))).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_text(), Some("done"));
        assert_eq!(answered.load(Ordering::SeqCst), 3);

        answered.store(0, Ordering::SeqCst);
        let once = HttpClient::with_config(ClientConfig::default().with_max_retries(1)).unwrap();
        let response = once.call(Request::get(format!("{base}/work"))).unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(answered.load(Ordering::SeqCst), 2);

        answered.store(0, Ordering::SeqCst);
        let post = client.call(Request::post(format!("{base}/work"), "x")).unwrap();
        assert_eq!(post.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(answered.load(Ordering::SeqCst), 1);

        server.stop();
    }

    #[test]
    fn test_closed_connections_are_retried() {
        init_logging();
        let (base, accepted, server) = flaky_server(2);
        let client = HttpClient::with_config(ClientConfig::default().with_max_retries(2)).unwrap();

        let response = client.call(Request::get(format!("{base}/flaky"))).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_text(), Some("ok"));
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
        server.join().unwrap();
    }

    #[test]
    fn test_retries_exhausted_fails_call() {
        init_logging();
        let (base, accepted, server) = flaky_server(3);
        let client = HttpClient::with_config(ClientConfig::default().with_max_retries(2)).unwrap();

        let err = client.call(Request::get(format!("{base}/flaky"))).unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
        assert_eq!(accepted.load(Ordering::SeqCst), 3);

        // the next connection is answered, which lets the server thread finish
        let response = client.call(Request::get(format!("{base}/flaky"))).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        server.join().unwrap();
    }

    #[test]
    fn test_https_through_proxy_opens_tunnel() {
        init_logging();
        let (port, proxy) = fake_proxy(b"HTTP/1.1 200 Connection established\r\n\r\n");
        let config = ClientConfig::default()
            .with_max_retries(0)
            .with_call_timeout(Duration::from_secs(5))
            .with_proxy(Some(
                ProxyConfig::new("127.0.0.1", port).with_credentials("user", "secret"),
            ));
        let client = HttpClient::with_config(config).unwrap();

        // the fake proxy hangs up after the TLS hello, so the call itself fails
        assert!(client
            .call(Request::get("https://example.test/secure"))
            .is_err());
        let (head, first) = proxy.join().unwrap();
        assert!(head.starts_with("CONNECT example.test:443 HTTP/1.1\r\n"), "{head}");
        assert!(head.contains("Host: example.test:443\r\n"), "{head}");
        assert!(head.contains("Proxy-Authorization: Basic dXNlcjpzZWNyZXQ=\r\n"), "{head}");
        // a TLS handshake record
        assert_eq!(first, Some(0x16));
    }

    #[test]
    fn test_refused_tunnel_fails_call() {
        init_logging();
        let (port, proxy) = fake_proxy(
            b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n",
        );
        let config = ClientConfig::default()
            .with_max_retries(0)
            .with_call_timeout(Duration::from_secs(5))
            .with_proxy(Some(ProxyConfig::new("127.0.0.1", port)));
        let client = HttpClient::with_config(config).unwrap();

        let err = client
            .call(Request::get("https://example.test/secure"))
            .unwrap_err();
        assert!(matches!(err, HttpError::Upgrade(_)), "{err:?}");
        let (head, first) = proxy.join().unwrap();
        assert!(!head.contains("Proxy-Authorization"), "{head}");
        assert_eq!(first, None);
    }
}
