use async_trait::async_trait;
use dgsm_link::frame::SEPARATOR;
use dgsm_link::{Link, LinkConfig, LinkHandler, LinkState, Payload, Role, UserCmd};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug)]
enum Event {
	Connect,
	Disconnect,
	Message(Payload),
}

struct Recorder {
	events: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl LinkHandler<Payload> for Recorder {
	async fn on_message(&self, _link: Link<Payload>, msg: Payload) {
		let _ = self.events.send(Event::Message(msg));
	}

	async fn on_connect(&self, _link: Link<Payload>) {
		let _ = self.events.send(Event::Connect);
	}

	async fn on_disconnect(&self, _link: Link<Payload>) {
		let _ = self.events.send(Event::Disconnect);
	}
}

/// Only handles messages; connect and disconnect use the default callbacks.
struct Inbox {
	messages: mpsc::UnboundedSender<Payload>,
}

#[async_trait]
impl LinkHandler<Payload> for Inbox {
	async fn on_message(&self, _link: Link<Payload>, msg: Payload) {
		let _ = self.messages.send(msg);
	}
}

fn free_addr() -> String {
	let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
	let addr = socket.local_addr().unwrap();
	drop(socket);
	addr.to_string()
}

fn peer(role: Role, addr: &str) -> (Link<Payload>, mpsc::UnboundedReceiver<Event>) {
	let (tx, rx) = mpsc::unbounded_channel();
	let config = LinkConfig::new(role, addr).poll_interval(Duration::from_millis(50));
	(Link::new(config, Recorder { events: tx }), rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
	timeout(Duration::from_secs(5), rx.recv())
		.await
		.expect("timed out waiting for link event")
		.expect("event channel closed")
}

async fn connected(link: &Link<Payload>) {
	let mut state = link.watch();
	timeout(Duration::from_secs(5), state.wait_for(|s| *s == LinkState::Connected))
		.await
		.expect("timed out waiting for connection")
		.unwrap();
}

// --- Delivery ---

#[tokio::test]
async fn message_reaches_the_other_peer() {
	let addr = free_addr();
	let (server, mut server_rx) = peer(Role::Listen, &addr);
	let (client, mut client_rx) = peer(Role::Dial, &addr);
	assert!(server.spawn().await);
	assert!(client.spawn().await);

	assert!(matches!(next(&mut server_rx).await, Event::Connect));
	assert!(matches!(next(&mut client_rx).await, Event::Connect));
	connected(&client).await;

	let cmd = Payload {
		context: Some(serde_json::json!({ "channel": "general" })),
		user_cmd: Some(UserCmd::new("status").app("valheim")),
		..Payload::default()
	};
	assert!(client.write(&cmd).await.unwrap());

	match next(&mut server_rx).await {
		Event::Message(got) => assert_eq!(got, cmd),
		other => panic!("expected message, got {:?}", other),
	}

	connected(&server).await;
	assert!(server.write(&Payload::message("pong")).await.unwrap());
	match next(&mut client_rx).await {
		Event::Message(got) => assert_eq!(got.message.as_deref(), Some("pong")),
		other => panic!("expected message, got {:?}", other),
	}

	client.stop().await;
	server.stop().await;
}

#[tokio::test]
async fn malformed_frame_is_skipped() {
	let addr = free_addr();
	let (server, mut server_rx) = peer(Role::Listen, &addr);
	server.spawn().await;

	let mut raw = loop {
		match TcpStream::connect(&addr).await {
			Ok(stream) => break stream,
			Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
		}
	};
	assert!(matches!(next(&mut server_rx).await, Event::Connect));

	let mut bytes = b"not json".to_vec();
	bytes.extend_from_slice(&SEPARATOR);
	bytes.extend_from_slice(br#"{"message":"after"}"#);
	bytes.extend_from_slice(&SEPARATOR);
	raw.write_all(&bytes).await.unwrap();

	match next(&mut server_rx).await {
		Event::Message(got) => assert_eq!(got.message.as_deref(), Some("after")),
		other => panic!("expected message, got {:?}", other),
	}

	server.stop().await;
}

#[tokio::test]
async fn handler_with_default_callbacks_receives_messages() {
	let addr = free_addr();
	let (tx, mut inbox) = mpsc::unbounded_channel();
	let config = LinkConfig::new(Role::Listen, &addr).poll_interval(Duration::from_millis(50));
	let server = Link::new(config, Inbox { messages: tx });
	let (client, mut client_rx) = peer(Role::Dial, &addr);
	server.spawn().await;
	client.spawn().await;

	assert!(matches!(next(&mut client_rx).await, Event::Connect));
	assert!(client.write(&Payload::message("plain")).await.unwrap());
	let got = timeout(Duration::from_secs(5), inbox.recv())
		.await
		.expect("timed out waiting for message")
		.unwrap();
	assert_eq!(got.message.as_deref(), Some("plain"));

	client.stop().await;
	server.stop().await;
}

async fn raw_peer(addr: &str) -> TcpStream {
	loop {
		match TcpStream::connect(addr).await {
			Ok(stream) => break stream,
			Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
		}
	}
}

/// Writes large frames until the link reports an error or no peer.
fn flood(link: &Link<Payload>) -> tokio::task::JoinHandle<()> {
	let link = link.clone();
	let big = Payload::message("x".repeat(1 << 20));
	tokio::spawn(async move {
		while let Ok(true) = link.write(&big).await {}
	})
}

// --- Stalled peers ---

#[tokio::test]
async fn stop_abandons_a_stalled_write() {
	let addr = free_addr();
	let (server, mut server_rx) = peer(Role::Listen, &addr);
	server.spawn().await;

	let _silent = raw_peer(&addr).await;
	assert!(matches!(next(&mut server_rx).await, Event::Connect));
	connected(&server).await;

	let writer = flood(&server);
	tokio::time::sleep(Duration::from_millis(300)).await;
	assert!(!writer.is_finished());

	timeout(Duration::from_secs(3), server.stop())
		.await
		.expect("stop hung behind a stalled write");
	timeout(Duration::from_secs(3), writer)
		.await
		.expect("writer did not give up")
		.unwrap();
	assert_eq!(server.state(), LinkState::Disconnected);
}

#[tokio::test]
async fn stalled_write_drops_the_connection() {
	let addr = free_addr();
	let (tx, mut server_rx) = mpsc::unbounded_channel();
	let config = LinkConfig::new(Role::Listen, &addr)
		.poll_interval(Duration::from_millis(50))
		.write_timeout(Duration::from_millis(300));
	let server = Link::new(config, Recorder { events: tx });
	server.spawn().await;

	let _silent = raw_peer(&addr).await;
	assert!(matches!(next(&mut server_rx).await, Event::Connect));
	connected(&server).await;

	let writer = flood(&server);
	assert!(matches!(next(&mut server_rx).await, Event::Disconnect));
	timeout(Duration::from_secs(3), writer)
		.await
		.expect("writer did not give up")
		.unwrap();

	server.stop().await;
}

// --- Connection lifecycle ---

#[tokio::test]
async fn write_without_peer_is_dropped() {
	let (link, _rx) = peer(Role::Dial, &free_addr());
	assert!(!link.is_connected());
	assert!(!link.write(&Payload::message("nobody")).await.unwrap());
}

#[tokio::test]
async fn both_peers_reconnect_after_drop() {
	let addr = free_addr();
	let (server, mut server_rx) = peer(Role::Listen, &addr);
	let (client, mut client_rx) = peer(Role::Dial, &addr);
	server.spawn().await;
	client.spawn().await;

	assert!(matches!(next(&mut server_rx).await, Event::Connect));
	assert!(matches!(next(&mut client_rx).await, Event::Connect));

	server.disconnect().await;

	assert!(matches!(next(&mut server_rx).await, Event::Disconnect));
	assert!(matches!(next(&mut client_rx).await, Event::Disconnect));
	assert!(matches!(next(&mut server_rx).await, Event::Connect));
	assert!(matches!(next(&mut client_rx).await, Event::Connect));

	connected(&client).await;
	assert!(client.write(&Payload::message("again")).await.unwrap());
	match next(&mut server_rx).await {
		Event::Message(got) => assert_eq!(got.message.as_deref(), Some("again")),
		other => panic!("expected message, got {:?}", other),
	}

	client.stop().await;
	server.stop().await;
}

#[tokio::test]
async fn dialer_keeps_polling_until_listener_appears() {
	let addr = free_addr();
	let (client, mut client_rx) = peer(Role::Dial, &addr);
	client.spawn().await;

	tokio::time::sleep(Duration::from_millis(200)).await;
	assert!(!client.is_connected());

	let (server, _server_rx) = peer(Role::Listen, &addr);
	server.spawn().await;
	assert!(matches!(next(&mut client_rx).await, Event::Connect));

	client.stop().await;
	server.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent() {
	let addr = free_addr();
	let (server, _rx) = peer(Role::Listen, &addr);
	assert!(server.spawn().await);
	assert!(!server.spawn().await);

	server.stop().await;
	server.stop().await;
	assert_eq!(server.state(), LinkState::Disconnected);
	assert!(!server.write(&Payload::message("late")).await.unwrap());

	assert!(server.spawn().await);
	server.stop().await;
}
