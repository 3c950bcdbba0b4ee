#[cfg(all(feature = "tcp", feature = "websocket"))]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        thread,
        time::{Duration, Instant},
    };

    use nbhttp::{
        handler::handler_fn,
        http::HttpClient,
        message::Request,
        server::HttpServer,
        websocket::{WebSocketSession, WsMessage},
        Publish, PublishOutcome, Receive, ReceiveOutcome, Session, SessionStatus,
    };

    type Accepted = Arc<Mutex<Option<WebSocketSession>>>;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn websocket_server() -> (nbhttp::server::ServerHandle, Accepted) {
        init_logging();
        let accepted: Accepted = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&accepted);
        let server = HttpServer::bind("127.0.0.1:0").unwrap().route(
            "/ws",
            handler_fn(move |exchange| {
                let slot = Arc::clone(&slot);
                exchange.upgrade_websocket(move |session| *slot.lock().unwrap() = Some(session))
            }),
        );
        (server.start().unwrap(), accepted)
    }

    fn receive_owned(session: &mut WebSocketSession) -> Option<WsMessage<'static>> {
        match session.receive().unwrap() {
            ReceiveOutcome::Payload(message) => Some(message.into_owned()),
            ReceiveOutcome::Buffered | ReceiveOutcome::Idle => None,
        }
    }

    #[test]
    fn test_echo_over_tcp() {
        let (server, accepted) = websocket_server();
        let mut client =
            WebSocketSession::connect(&format!("ws://{}/ws", server.local_addr())).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while client.status() == SessionStatus::Establishing {
            assert!(Instant::now() < deadline, "handshake did not complete");
            client.drive().unwrap();
        }
        assert_eq!(client.status(), SessionStatus::Established);
        while accepted.lock().unwrap().is_none() {
            assert!(Instant::now() < deadline, "server never opened the session");
            thread::sleep(Duration::from_millis(1));
        }
        let mut session = accepted.lock().unwrap().take().unwrap();

        let payload = "x".repeat(70_000);
        let mut outbound = vec![WsMessage::text("hello"), WsMessage::text(payload.as_str())];
        outbound.reverse();
        let mut echoed = Vec::new();
        while echoed.len() < 2 {
            assert!(Instant::now() < deadline, "messages were not echoed");
            if let Some(message) = outbound.pop() {
                if let PublishOutcome::Incomplete(message) = client.publish(message).unwrap() {
                    outbound.push(message);
                }
            }
            client.drive().unwrap();
            session.drive().unwrap();
            if let Some(message) = receive_owned(&mut session) {
                let mut pending = message;
                loop {
                    match session.publish(pending).unwrap() {
                        PublishOutcome::Published => break,
                        PublishOutcome::Incomplete(x) => {
                            pending = x;
                            session.drive().unwrap();
                        }
                    }
                }
            }
            if let Some(message) = receive_owned(&mut client) {
                echoed.push(message);
            }
        }
        assert_eq!(
            echoed,
            vec![WsMessage::text("hello"), WsMessage::text(payload)]
        );

        client.publish(WsMessage::Close(None)).unwrap();
        client.close();
        server.stop();
    }

    #[test]
    fn test_plain_request_to_websocket_route_is_rejected() {
        let (server, _) = websocket_server();
        let client = HttpClient::new().unwrap();

        let response = client
            .call(Request::get(format!("http://{}/ws", server.local_addr())))
            .unwrap();
        assert!(response.status().is_client_error() || response.status().is_server_error());

        server.stop();
    }
}
