#[cfg(test)]
mod tests {
    use crate::EchoHandler;
    use async_trait::async_trait;
    use axum::extract::ws::Message as AxumMessage;
    use axum::Error as AxumError;
    use channelhub::{
        accept_transport, Credentials, Node, NodeConfig, NodeError, Receiver as NodeReceiver,
        Sender as NodeSender, TransportInfo,
    };
    use chrono::{Datelike, Utc};
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, Mutex as TokioMutex};

    #[derive(Clone)]
    struct MockSocket {
        incoming: Arc<TokioMutex<mpsc::UnboundedReceiver<String>>>,
        outgoing: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl NodeSender for MockSocket {
        async fn send(&mut self, message: AxumMessage) -> Result<(), AxumError> {
            if let AxumMessage::Text(text) = message {
                self.outgoing.send(text).map_err(AxumError::new)?;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl NodeReceiver for MockSocket {
        async fn next(&mut self) -> Option<Result<AxumMessage, AxumError>> {
            let message = self.incoming.lock().await.recv().await?;
            Some(Ok(AxumMessage::Text(message)))
        }
    }

    struct TestClient {
        sender: mpsc::UnboundedSender<String>,
        receiver: mpsc::UnboundedReceiver<String>,
    }

    impl TestClient {
        fn pair() -> (TestClient, MockSocket) {
            let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
            let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
            let client = TestClient {
                sender: incoming_tx,
                receiver: outgoing_rx,
            };
            let socket = MockSocket {
                incoming: Arc::new(TokioMutex::new(incoming_rx)),
                outgoing: outgoing_tx,
            };
            (client, socket)
        }

        fn send(&self, frame: &str) {
            self.sender.send(frame.to_string()).unwrap();
        }

        async fn recv(&mut self) -> Value {
            self.recv_within(Duration::from_secs(5)).await
        }

        async fn recv_within(&mut self, wait: Duration) -> Value {
            let frame = tokio::time::timeout(wait, self.receiver.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection closed while waiting for a frame");
            serde_json::from_str(&frame).expect("received frame is not JSON")
        }

        async fn expect_closed(&mut self) {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.receiver.recv())
                .await
                .expect("timed out waiting for the connection to close");
            assert!(frame.is_none(), "expected closed connection, got {frame:?}");
        }
    }

    async fn start_echo_node() -> Node {
        let node = Node::new(NodeConfig {
            name: "echo".to_string(),
            version: "0.0.0".to_string(),
            history_meta_ttl: Duration::from_secs(24 * 3600),
        })
        .unwrap();
        node.set_event_handler(Arc::new(EchoHandler::new(node.clone())));
        node.run().await.unwrap();
        node
    }

    fn test_credentials() -> Credentials {
        Credentials {
            user_id: "42".to_string(),
            expire_at: Utc::now().timestamp() + 25,
            info: Some(
                serde_json::value::to_raw_value(&serde_json::json!({"name": "Test User"}))
                    .unwrap(),
            ),
        }
    }

    async fn connect(node: &Node) -> TestClient {
        let (mut client, socket) = TestClient::pair();
        let node = node.clone();
        let receiver = socket.clone();
        tokio::spawn(async move {
            accept_transport(
                node,
                Box::new(socket),
                receiver,
                test_credentials(),
                TransportInfo::websocket(),
                Duration::from_secs(5),
            )
            .await;
        });
        client.send(r#"{"id":1,"connect":{}}"#);
        let reply = client.recv().await;
        assert_eq!(reply["id"], 1);
        assert!(reply["error"].is_null(), "connect failed: {reply}");
        client
    }

    /// Subscribes to a channel and consumes the reply plus this session's
    /// own join push.
    async fn subscribe(client: &mut TestClient, id: u64, channel: &str) {
        client.send(&format!(
            r#"{{"id":{id},"subscribe":{{"channel":"{channel}"}}}}"#
        ));
        let reply = client.recv().await;
        assert!(reply["error"].is_null(), "subscribe failed: {reply}");
        let join = client.recv().await;
        assert_eq!(join["push"]["join"]["info"]["user"], "42");
    }

    #[tokio::test]
    async fn test_connect_enrolls_server_side_subscriptions() {
        let node = start_echo_node().await;
        let (mut client, socket) = TestClient::pair();
        let receiver = socket.clone();
        let spawn_node = node.clone();
        tokio::spawn(async move {
            accept_transport(
                spawn_node,
                Box::new(socket),
                receiver,
                test_credentials(),
                TransportInfo::websocket(),
                Duration::from_secs(5),
            )
            .await;
        });
        client.send(r#"{"id":1,"connect":{}}"#);
        let reply = client.recv().await;
        let connect = &reply["connect"];
        assert_eq!(connect["data"], serde_json::json!({}));
        assert_eq!(connect["expires"], true);
        let ttl = connect["ttl"].as_u64().unwrap();
        assert!(ttl > 0 && ttl <= 25);
        let subs = connect["subs"].as_object().unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs["#42"]["recoverable"], true);
        assert_eq!(subs["notification:index"]["recoverable"], true);
    }

    #[tokio::test]
    async fn test_subscribe_allowed_channel_gets_welcome() {
        let node = start_echo_node().await;
        let mut client = connect(&node).await;
        client.send(r#"{"id":2,"subscribe":{"channel":"chat:index"}}"#);
        let reply = client.recv().await;
        assert_eq!(reply["id"], 2);
        assert_eq!(reply["subscribe"]["recoverable"], true);
        assert_eq!(
            reply["subscribe"]["data"],
            serde_json::json!({"msg": "welcome"})
        );
        // Join/leave is both emitted and pushed, so the subscriber sees its
        // own join right after the reply.
        let join = client.recv().await;
        assert_eq!(join["push"]["channel"], "chat:index");
        assert_eq!(join["push"]["join"]["info"]["user"], "42");
    }

    #[tokio::test]
    async fn test_subscribe_denied_outside_allow_list() {
        let node = start_echo_node().await;
        let mut client = connect(&node).await;
        client.send(r#"{"id":2,"subscribe":{"channel":"secret:x"}}"#);
        let reply = client.recv().await;
        assert_eq!(reply["id"], 2);
        assert_eq!(reply["error"]["code"], 103);
        assert_eq!(reply["error"]["message"], "permission denied");
    }

    #[tokio::test]
    async fn test_publish_rewrites_timestamp_with_server_time() {
        let node = start_echo_node().await;
        let mut client = connect(&node).await;
        subscribe(&mut client, 2, "chat:index").await;

        let before = Utc::now().timestamp();
        client.send(r#"{"id":3,"publish":{"channel":"chat:index","data":{"timestamp":0,"input":"hi"}}}"#);
        let push = client.recv().await;
        let after = Utc::now().timestamp();
        assert_eq!(push["push"]["channel"], "chat:index");
        let publication = &push["push"]["pub"];
        assert_eq!(publication["data"]["input"], "hi");
        let stamped = publication["data"]["timestamp"].as_i64().unwrap();
        assert!(stamped >= before && stamped <= after, "timestamp {stamped} outside [{before}, {after}]");
        assert_eq!(publication["info"]["user"], "42");

        let reply = client.recv().await;
        assert_eq!(reply["id"], 3);
        assert_eq!(reply["publish"]["offset"], 1);
    }

    #[tokio::test]
    async fn test_publish_requires_subscription() {
        let node = start_echo_node().await;
        let mut client = connect(&node).await;
        client.send(r#"{"id":2,"publish":{"channel":"chat:index","data":{"timestamp":0,"input":"hi"}}}"#);
        let reply = client.recv().await;
        assert_eq!(reply["error"]["code"], 103);
    }

    #[tokio::test]
    async fn test_publish_allowed_on_server_side_subscription() {
        let node = start_echo_node().await;
        let mut client = connect(&node).await;
        // notification:index was subscribed server-side at connect.
        client.send(
            r#"{"id":2,"publish":{"channel":"notification:index","data":{"timestamp":5,"input":"x"}}}"#,
        );
        let push = client.recv().await;
        assert_eq!(push["push"]["channel"], "notification:index");
        let reply = client.recv().await;
        assert!(reply["error"].is_null());
        assert_eq!(reply["publish"]["offset"], 1);
    }

    #[tokio::test]
    async fn test_publish_malformed_payload_rejected() {
        let node = start_echo_node().await;
        let mut client = connect(&node).await;
        subscribe(&mut client, 2, "chat:index").await;
        client.send(r#"{"id":3,"publish":{"channel":"chat:index","data":"not a message"}}"#);
        let reply = client.recv().await;
        assert_eq!(reply["id"], 3);
        assert_eq!(reply["error"]["code"], 107);
        assert_eq!(reply["error"]["message"], "bad request");
    }

    #[tokio::test]
    async fn test_rpc_get_current_year() {
        let node = start_echo_node().await;
        let mut client = connect(&node).await;
        client.send(r#"{"id":2,"rpc":{"method":"getCurrentYear"}}"#);
        let reply = client.recv().await;
        assert_eq!(
            reply["rpc"]["data"],
            serde_json::json!({"year": Utc::now().year()})
        );
    }

    #[tokio::test]
    async fn test_rpc_echo_returns_request_data() {
        let node = start_echo_node().await;
        let mut client = connect(&node).await;
        client.send(r#"{"id":2,"rpc":{"method":"echo","data":{"a":[1,2,3],"b":"x"}}}"#);
        let reply = client.recv().await;
        assert_eq!(
            reply["rpc"]["data"],
            serde_json::json!({"a": [1, 2, 3], "b": "x"})
        );
    }

    #[tokio::test]
    async fn test_rpc_unknown_method() {
        let node = start_echo_node().await;
        let mut client = connect(&node).await;
        client.send(r#"{"id":2,"rpc":{"method":"getCurrentMonth"}}"#);
        let reply = client.recv().await;
        assert_eq!(reply["error"]["code"], 104);
    }

    #[tokio::test]
    async fn test_async_message_echoed_verbatim() {
        let node = start_echo_node().await;
        let mut client = connect(&node).await;
        client.send(r#"{"send":{"data":{"nested":{"payload":[true,null,"x"]}}}}"#);
        let push = client.recv().await;
        assert_eq!(
            push["push"]["message"]["data"],
            serde_json::json!({"nested": {"payload": [true, null, "x"]}})
        );
    }

    #[tokio::test]
    async fn test_presence_denied_without_subscription() {
        let node = start_echo_node().await;
        let mut client = connect(&node).await;
        client.send(r#"{"id":2,"presence":{"channel":"chat:index"}}"#);
        let reply = client.recv().await;
        assert_eq!(reply["error"]["code"], 103);
    }

    #[tokio::test]
    async fn test_presence_after_subscribe() {
        let node = start_echo_node().await;
        let mut client = connect(&node).await;
        subscribe(&mut client, 2, "chat:index").await;
        client.send(r#"{"id":3,"presence":{"channel":"chat:index"}}"#);
        let reply = client.recv().await;
        let presence = reply["presence"]["presence"].as_object().unwrap();
        assert_eq!(presence.len(), 1);
        for info in presence.values() {
            assert_eq!(info["user"], "42");
            assert_eq!(info["conn_info"], serde_json::json!({"name": "Test User"}));
        }
    }

    #[tokio::test]
    async fn test_client_refresh_command_rejected() {
        let node = start_echo_node().await;
        let mut client = connect(&node).await;
        // Client-side refresh is disabled in the connect reply.
        client.send(r#"{"id":2,"refresh":{}}"#);
        let reply = client.recv().await;
        assert_eq!(reply["error"]["code"], 107);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_frames_survive_session_refresh() {
        let node = start_echo_node().await;
        let mut client = connect(&node).await;

        // The first heartbeat lands one period in, past the 25 second
        // session TTL, so receiving it proves refresh kept the session.
        for _ in 0..2 {
            let push = client.recv_within(Duration::from_secs(300)).await;
            let data = push["push"]["message"]["data"].as_object().unwrap();
            assert_eq!(data.len(), 1);
            let time = data["time"].as_str().unwrap();
            assert!(time.parse::<i64>().is_ok(), "heartbeat time not numeric: {time}");
        }
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_connected_client() {
        let node = start_echo_node().await;
        let mut client = connect(&node).await;
        subscribe(&mut client, 2, "chat:index").await;

        node.shutdown().await;
        let push = client.recv().await;
        assert_eq!(push["push"]["disconnect"]["code"], 3001);
        assert_eq!(push["push"]["disconnect"]["reason"], "shutting down");
        client.expect_closed().await;

        let payload = serde_json::value::to_raw_value(&serde_json::json!({"x": 1})).unwrap();
        let err = node
            .publish("chat:index", payload, Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::NotRunning));
    }
}
