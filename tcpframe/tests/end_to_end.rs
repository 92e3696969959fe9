//! Loopback scenarios driving `RequestServer` end to end over real TCP sockets,
//! both in raw length-prefixed mode and through a hand-rolled WebSocket client.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use sha1::{Digest, Sha1};
use tcpframe::{Client, Handler, ListenerSpec, RequestServer};

fn echo_handler(
    _index: usize,
    _client: &Arc<Client>,
    category: u8,
    method: u8,
    params: &mut tcpframe::ByteBuffer,
    response: &mut tcpframe::ByteBuffer,
    _state: &(),
) -> bool {
    response.write_u8(category);
    response.write_u8(method);
    let remaining = params.len() - params.cursor();
    if remaining > 0 {
        let payload = params.read(remaining).unwrap().to_vec();
        response.write(&payload);
    }
    true
}

fn start_server(websocket: bool) -> RequestServer<()> {
    let log = slog::Logger::root(slog::Discard, slog::o!());
    let handler: Arc<Handler<()>> = Arc::new(echo_handler);
    RequestServer::new(
        &[ListenerSpec { port: 0, websocket }],
        2,
        0xFFFF,
        handler,
        Arc::new(()),
        log,
    )
    .unwrap()
}

fn build_tcp_request(id: u16, category: u8, method: u8, payload: &[u8]) -> Vec<u8> {
    let mut body = vec![];
    body.extend_from_slice(&id.to_le_bytes());
    body.push(category);
    body.push(method);
    body.extend_from_slice(payload);
    let mut framed = vec![];
    framed.extend_from_slice(&(body.len() as u16).to_le_bytes());
    framed.extend_from_slice(&body);
    framed
}

// S1: a single request sent in one write gets one matching response.
#[test]
fn scenario_single_request() {
    let server = start_server(false);
    let port = server.bound_ports()[0];
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.write_all(&build_tcp_request(42, 1, 9, b"payload")).unwrap();

    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), 42);
    assert_eq!(&buf[2..4], &[1, 9]);
    assert_eq!(&buf[4..n], b"payload");
}

// S2: the request arrives split across several writes; the server must still
// reassemble it into exactly one message.
#[test]
fn scenario_partial_write_reassembly() {
    let server = start_server(false);
    let port = server.bound_ports()[0];
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let request = build_tcp_request(7, 2, 2, b"split-me");

    for chunk in request.chunks(3) {
        stream.write_all(chunk).unwrap();
        std::thread::sleep(Duration::from_millis(20));
    }

    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), 7);
    assert_eq!(&buf[4..n], b"split-me");
}

// S6: a handler that always refuses exhausts MAX_RETRIES and gets one response
// carrying the retry sentinel.
#[test]
fn scenario_retry_exhaustion_sends_sentinel() {
    let log = slog::Logger::root(slog::Discard, slog::o!());
    let handler: Arc<Handler<()>> =
        Arc::new(|_idx, _client, _cat, _method, _params, _response, _state| false);
    let server = RequestServer::new(
        &[ListenerSpec { port: 0, websocket: false }],
        1,
        0x5A5A,
        handler,
        Arc::new(()),
        log,
    )
    .unwrap();

    let port = server.bound_ports()[0];
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.write_all(&build_tcp_request(1, 0, 0, b"")).unwrap();

    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(n, 4);
    assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 0x5A5A);
}

fn ws_handshake(stream: &mut TcpStream) {
    let key = "dGhlIHNhbXBsZSBub25jZQ==";
    let request = format!(
        "GET / HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n\r\n",
        key
    );
    stream.write_all(request.as_bytes()).unwrap();

    let mut response = [0u8; 256];
    let n = stream.read(&mut response).unwrap();
    let text = String::from_utf8_lossy(&response[..n]);
    assert!(text.starts_with("HTTP/1.1 101 Switching Protocols"));

    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
    use base64::Engine;
    let expected = base64::engine::general_purpose::STANDARD.encode(hasher.finalize());
    assert!(text.contains(&expected));
}

fn ws_client_frame(opcode: u8, fin: bool, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![];
    frame.push((if fin { 0x80 } else { 0x00 }) | opcode);
    let mask = [0x11u8, 0x22, 0x33, 0x44];
    if payload.len() <= 125 {
        frame.push(0x80 | payload.len() as u8);
    } else {
        frame.push(0x80 | 126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    frame.extend_from_slice(&mask);
    for (i, byte) in payload.iter().enumerate() {
        frame.push(byte ^ mask[i % 4]);
    }
    frame
}

fn read_server_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).unwrap();
    let opcode = header[0] & 0x0F;
    assert_eq!(header[1] & 0x80, 0, "server frames must never be masked");
    let len7 = header[1] & 0x7F;
    let length = if len7 == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext).unwrap();
        u16::from_be_bytes(ext) as usize
    } else {
        len7 as usize
    };
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).unwrap();
    (opcode, payload)
}

// S3: handshake followed by a single unfragmented binary message round-trips.
#[test]
fn scenario_websocket_single_binary_message() {
    let server = start_server(true);
    let port = server.bound_ports()[0];
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    ws_handshake(&mut stream);

    let mut body = vec![];
    body.extend_from_slice(&9u16.to_le_bytes());
    body.push(3);
    body.push(4);
    body.extend_from_slice(b"ws-hi");

    stream.write_all(&ws_client_frame(0x2, true, &body)).unwrap();

    let (opcode, payload) = read_server_frame(&mut stream);
    assert_eq!(opcode, 0x2);
    assert_eq!(u16::from_le_bytes([payload[0], payload[1]]), 9);
    assert_eq!(&payload[2..4], &[3, 4]);
    assert_eq!(&payload[4..], b"ws-hi");
}

// S4: a binary message fragmented across two frames is reassembled before dispatch.
#[test]
fn scenario_websocket_fragmented_binary_message() {
    let server = start_server(true);
    let port = server.bound_ports()[0];
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    ws_handshake(&mut stream);

    let mut body = vec![];
    body.extend_from_slice(&11u16.to_le_bytes());
    body.push(1);
    body.push(1);
    body.extend_from_slice(b"fragmented-payload");

    let (first, second) = body.split_at(6);
    stream.write_all(&ws_client_frame(0x2, false, first)).unwrap();
    stream.write_all(&ws_client_frame(0x0, true, second)).unwrap();

    let (opcode, payload) = read_server_frame(&mut stream);
    assert_eq!(opcode, 0x2);
    assert_eq!(&payload[4..], b"fragmented-payload");
}

// S5: a ping is echoed as a pong with the same payload.
#[test]
fn scenario_websocket_ping_gets_ponged() {
    let server = start_server(true);
    let port = server.bound_ports()[0];
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    ws_handshake(&mut stream);

    stream.write_all(&ws_client_frame(0x9, true, b"ping-body")).unwrap();

    let (opcode, payload) = read_server_frame(&mut stream);
    assert_eq!(opcode, 0xA);
    assert_eq!(payload, b"ping-body");
}
