#[cfg(feature = "tcp")]
mod tests {
    use std::time::{Duration, Instant};

    use nbhttp::{
        client::HttpClientConnection,
        handler::handler_fn,
        message::{Request, Response},
        server::HttpServer,
        tcp::{TcpServer, TcpSession},
        Publish, PublishOutcome, Receive, ReceiveOutcome, Session, SessionStatus,
    };

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_large_payload_between_sessions() {
        init_logging();
        let server = TcpServer::bind("127.0.0.1:0").unwrap();
        let mut client = TcpSession::connect(&server.local_addr().unwrap().to_string()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut session = None;
        while session.is_none() {
            assert!(Instant::now() < deadline);
            client.drive().unwrap();
            session = server.accept().unwrap().map(|(s, _)| s);
        }
        let mut session = session.unwrap();

        let payload: Vec<u8> = (0..4_000_000u32).map(|i| i as u8).collect();
        let mut remaining = payload.as_slice();
        let mut received = Vec::new();
        while received.len() < payload.len() {
            assert!(Instant::now() < deadline, "payload not delivered");
            client.drive().unwrap();
            if !remaining.is_empty() && client.status() == SessionStatus::Established {
                remaining = match client.publish(remaining).unwrap() {
                    PublishOutcome::Published => &[],
                    PublishOutcome::Incomplete(x) => x,
                };
            }
            session.drive().unwrap();
            if let ReceiveOutcome::Payload(data) = session.receive().unwrap() {
                received.extend_from_slice(data);
            }
        }
        assert_eq!(received, payload);
    }

    #[test]
    fn test_client_connection_pipelines_requests() {
        init_logging();
        let server = HttpServer::bind("127.0.0.1:0")
            .unwrap()
            .with_handler(handler_fn(|exchange| {
                let path = exchange.request().header().path().to_owned();
                exchange.send(Response::text(200, &path))
            }))
            .start()
            .unwrap();
        let addr = server.local_addr();

        let mut conn =
            HttpClientConnection::connect(&addr.ip().to_string(), addr.port(), false).unwrap();
        let first = conn.send_future(Request::get("/one")).unwrap();
        let second = conn.send_future(Request::get("/two")).unwrap();
        assert_eq!(conn.pending(), 2);

        let deadline = Instant::now() + Duration::from_secs(5);
        while conn.pending() > 0 {
            assert!(Instant::now() < deadline, "responses not received");
            conn.drive().unwrap();
        }
        let first = first.try_get().unwrap().unwrap();
        let second = second.try_get().unwrap().unwrap();
        let timeout = Duration::from_secs(1);
        assert_eq!(first.body().clone().into_string(timeout).unwrap(), "/one");
        assert_eq!(second.body().clone().into_string(timeout).unwrap(), "/two");
        assert!(conn.is_persistent());
        assert_eq!(conn.transactions(), 2);

        server.stop();
    }
}
