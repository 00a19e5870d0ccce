//! Integration tests for the TCP message server.
//!
//! Each test runs a real server on an ephemeral loopback port and talks to
//! it through plain `TcpStream` clients.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use gulp_server::{Server, ServerAddr, ServerHost, Settings};
use serde_json::{json, Value};

const HELLO: &str = "{\"handshake\":\"hello\"}\n";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `condition` until it holds or five seconds pass.
fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn start_server() -> (Server, SocketAddr) {
    init_logging();
    let server = Server::new();
    let addr = server.start(&ServerAddr::new("127.0.0.1", 0)).unwrap();
    (server, addr)
}

/// Test client with a line reader over its socket.
struct Client {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Self { stream, reader }
    }

    /// Connect and complete the handshake as `id`.
    fn handshake(addr: SocketAddr, id: &str) -> Self {
        let mut client = Self::connect(addr);
        client.send(&json!({ "id": id }));
        assert_eq!(client.read_line(), HELLO);
        client
    }

    fn send(&mut self, value: &Value) {
        let mut bytes = serde_json::to_vec(value).unwrap();
        bytes.push(b'\n');
        self.stream.write_all(&bytes).unwrap();
    }

    fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line
    }
}

#[test]
fn test_handshake_registers_client() {
    let (server, addr) = start_server();

    let _alpha = Client::handshake(addr, "alpha");

    assert!(wait_for(|| server.registry().len() == 1));
    assert_eq!(server.registry().client_ids(), vec!["alpha"]);
    server.stop().unwrap();
}

#[test]
fn test_handshake_without_id_is_closed() {
    let (server, addr) = start_server();

    let mut client = Client::connect(addr);
    client.send(&json!({}));

    // No acknowledgement: the server just closes the socket.
    assert_eq!(client.read_line(), "");
    assert!(server.registry().is_empty());
    assert!(wait_for(|| server.registry().pending_len() == 0));
    server.stop().unwrap();
}

#[test]
fn test_send_to_reaches_only_the_target() {
    let (server, addr) = start_server();
    let mut alpha = Client::handshake(addr, "alpha");
    let mut beta = Client::handshake(addr, "beta");
    assert!(wait_for(|| server.registry().len() == 2));

    assert!(server.send_to("beta", &json!({"x": 1})));
    assert_eq!(beta.read_line(), "{\"x\":1}\n");

    // alpha's next line is the broadcast, proving nothing else was queued.
    assert_eq!(server.broadcast(&json!({"y": 2})), 2);
    assert_eq!(alpha.read_line(), "{\"y\":2}\n");
    assert_eq!(beta.read_line(), "{\"y\":2}\n");
    server.stop().unwrap();
}

#[test]
fn test_abrupt_disconnect_removes_only_that_client() {
    let (server, addr) = start_server();
    let mut alpha = Client::handshake(addr, "alpha");
    let beta = Client::handshake(addr, "beta");
    assert!(wait_for(|| server.registry().len() == 2));

    drop(beta);

    assert!(wait_for(|| server.registry().client_ids() == vec!["alpha"]));
    assert_eq!(server.broadcast(&json!({"still": "here"})), 1);
    assert_eq!(alpha.read_line(), "{\"still\":\"here\"}\n");
    server.stop().unwrap();
}

#[test]
fn test_stop_disconnects_clients_and_restart_reuses_port() {
    let (server, addr) = start_server();
    let mut alpha = Client::handshake(addr, "alpha");
    assert!(wait_for(|| server.registry().len() == 1));

    server.stop().unwrap();
    assert!(server.registry().is_empty());
    assert_eq!(alpha.read_line(), "", "client sees EOF after stop");

    let again = server
        .start(&ServerAddr::new("127.0.0.1", addr.port()))
        .unwrap();
    assert_eq!(again, addr);
    let _beta = Client::handshake(again, "beta");
    assert!(wait_for(|| server.registry().len() == 1));
    server.stop().unwrap();
}

#[test]
fn test_messages_dispatch_in_order() {
    let (server, addr) = start_server();
    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = Arc::clone(&received);
        server.set_handler(move |msg| {
            received.lock().unwrap().push(msg.clone());
            Ok(())
        });
    }

    let mut client = Client::handshake(addr, "alpha");
    for n in 0..20 {
        client.send(&json!({ "n": n }));
    }
    // Several messages in one write arrive as one receive cycle.
    client.stream.write_all(b"{\"n\":20}\n{\"n\":21}\n").unwrap();

    assert!(wait_for(|| received.lock().unwrap().len() == 22));
    let order: Vec<i64> = received
        .lock()
        .unwrap()
        .iter()
        .map(|m| m["n"].as_i64().unwrap())
        .collect();
    assert_eq!(order, (0..22).collect::<Vec<_>>());
    server.stop().unwrap();
}

#[test]
fn test_failing_handler_keeps_connection_open() {
    let (server, addr) = start_server();
    server.set_handler(|msg| {
        if msg.get("fail").is_some() {
            anyhow::bail!("handler rejected message");
        }
        Ok(())
    });

    let mut client = Client::handshake(addr, "alpha");
    client.send(&json!({"fail": true}));
    client.send(&json!({"ok": true}));

    assert!(server.send_to("alpha", &json!({"pong": 1})));
    assert_eq!(client.read_line(), "{\"pong\":1}\n");
    assert_eq!(server.registry().len(), 1);
    server.stop().unwrap();
}

#[test]
fn test_host_lifecycle_with_settings() {
    init_logging();
    let settings: Settings =
        Settings::from_json_str(r#"{"host": "127.0.0.1", "port": 0, "start_delay_ms": 0}"#)
            .unwrap();
    let host = ServerHost::new(Arc::new(Server::new()), Arc::new(settings));

    assert!(host.can_start());
    host.on_load();
    host.wait_for_scheduled_start();
    assert!(host.is_running());
    assert!(host.can_stop());

    let addr = host.server().local_addr().unwrap();
    let _client = Client::handshake(addr, "alpha");

    host.on_unload();
    assert!(!host.is_running());
    assert!(host.server().registry().is_empty());
}
