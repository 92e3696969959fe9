use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use byteorder::{BigEndian, ByteOrder};
use sha1::{Digest, Sha1};

use super::error::{CloseCode, Error, Result};
use super::socket::Socket;
use super::MESSAGE_MAX_SIZE;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

#[derive(Debug)]
pub struct Message {
    pub data: Vec<u8>,
    pub closed: bool,
}

/// A WebSocket connection: before the handshake completes, accumulated bytes are
/// scanned for an HTTP upgrade request; afterwards, they are parsed as RFC 6455
/// frames (the subset described in `net::websocket`'s module docs).
pub struct WebSocketConnection {
    socket: Socket,
    buffer: Vec<u8>,
    bytes_received: usize,
    ready: bool,
    /// Length of unmasked payload already reassembled at the front of `buffer`
    /// from prior non-FIN Binary/Continuation frames.
    reassembled: usize,
}

impl WebSocketConnection {
    pub fn new(socket: Socket) -> WebSocketConnection {
        WebSocketConnection {
            socket,
            buffer: vec![0u8; MESSAGE_MAX_SIZE],
            bytes_received: 0,
            ready: false,
            reassembled: 0,
        }
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    pub fn poll_read(&mut self) -> Result<Vec<Message>> {
        let read = self.socket.read(&mut self.buffer[self.reassembled + self.bytes_received..])?;
        if read == 0 {
            return Ok(vec![Message { data: Vec::new(), closed: true }]);
        }
        self.bytes_received += read;

        if !self.ready {
            return self.try_handshake();
        }

        self.parse_frames()
    }

    fn try_handshake(&mut self) -> Result<Vec<Message>> {
        let window = &self.buffer[..self.bytes_received];
        let terminator = match find_subslice(window, b"\r\n\r\n") {
            Some(pos) => pos,
            None => return Ok(Vec::new()),
        };

        let headers = &window[..terminator];
        let key = find_header_value(headers, b"Sec-WebSocket-Key:")
            .ok_or(Error::Protocol(CloseCode::ProtocolError))?;

        let accept = compute_accept_key(&key);
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: WebSocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept
        );
        self.socket.ensure_write(response.as_bytes(), 10)?;

        let consumed = terminator + 4;
        self.buffer.copy_within(consumed..self.bytes_received, 0);
        self.bytes_received -= consumed;
        self.ready = true;

        Ok(Vec::new())
    }

    fn parse_frames(&mut self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();

        loop {
            let total = self.reassembled + self.bytes_received;
            let frame = &self.buffer[self.reassembled..total];
            if frame.len() < 2 {
                break;
            }

            let byte0 = frame[0];
            let byte1 = frame[1];
            let fin = byte0 & 0x80 != 0;
            let rsv = byte0 & 0x70;
            let opcode = byte0 & 0x0F;
            let masked = byte1 & 0x80 != 0;
            let length7 = byte1 & 0x7F;

            if rsv != 0 || !masked {
                self.close(CloseCode::ProtocolError)?;
                return Err(Error::Protocol(CloseCode::ProtocolError));
            }

            let mut header_len = 2;
            let payload_len: usize;
            if length7 == 127 {
                self.close(CloseCode::MessageTooBig)?;
                return Err(Error::Protocol(CloseCode::MessageTooBig));
            } else if length7 == 126 {
                if frame.len() < 4 {
                    break;
                }
                payload_len = BigEndian::read_u16(&frame[2..4]) as usize;
                header_len = 4;
            } else {
                payload_len = length7 as usize;
            }

            let needed = header_len + 4 + payload_len;
            if frame.len() < needed {
                break;
            }

            let old_reassembled = self.reassembled;
            let mask = [
                frame[header_len],
                frame[header_len + 1],
                frame[header_len + 2],
                frame[header_len + 3],
            ];
            let payload_start = old_reassembled + header_len + 4;
            for i in 0..payload_len {
                self.buffer[payload_start + i] ^= mask[i % 4];
            }
            let frame_end = old_reassembled + needed;

            match opcode {
                OP_TEXT => {
                    self.close(CloseCode::UnsupportedData)?;
                    return Err(Error::Protocol(CloseCode::UnsupportedData));
                }
                OP_CLOSE => {
                    self.close(CloseCode::Normal)?;
                    messages.push(Message { data: Vec::new(), closed: true });
                    return Ok(messages);
                }
                OP_PING => {
                    if payload_len > 125 {
                        self.close(CloseCode::MessageTooBig)?;
                        return Err(Error::Protocol(CloseCode::MessageTooBig));
                    }
                    let payload = self.buffer[payload_start..payload_start + payload_len].to_vec();
                    self.buffer.copy_within(frame_end..total, old_reassembled);
                    self.bytes_received = total - frame_end;
                    self.send_frame(OP_PONG, &payload)?;
                    continue;
                }
                OP_PONG => {
                    self.buffer.copy_within(frame_end..total, old_reassembled);
                    self.bytes_received = total - frame_end;
                    continue;
                }
                OP_CONTINUATION | OP_BINARY => {
                    // Slide the unmasked payload down over the header+mask bytes,
                    // extending the reassembly region at the buffer's front.
                    self.buffer
                        .copy_within(payload_start..payload_start + payload_len, old_reassembled);
                    self.reassembled = old_reassembled + payload_len;

                    if fin {
                        let data = self.buffer[..self.reassembled].to_vec();
                        messages.push(Message { data, closed: false });
                        self.buffer.copy_within(frame_end..total, 0);
                        self.bytes_received = total - frame_end;
                        self.reassembled = 0;
                    } else {
                        self.buffer.copy_within(frame_end..total, self.reassembled);
                        self.bytes_received = total - frame_end;
                    }
                    continue;
                }
                _ => {
                    self.close(CloseCode::ProtocolError)?;
                    return Err(Error::Protocol(CloseCode::ProtocolError));
                }
            }
        }

        Ok(messages)
    }

    /// Sends `payload` as a single unmasked, FIN-set frame. Server-to-client
    /// frames are never masked. Payloads over 65535 bytes are rejected.
    pub fn send_frame(&mut self, opcode: u8, payload: &[u8]) -> Result<()> {
        if payload.len() > 65535 {
            return Err(Error::Protocol(CloseCode::PayloadTooBig));
        }
        let mut header = vec![0x80 | opcode];
        if payload.len() <= 125 {
            header.push(payload.len() as u8);
        } else {
            header.push(126);
            let mut ext = [0u8; 2];
            BigEndian::write_u16(&mut ext, payload.len() as u16);
            header.extend_from_slice(&ext);
        }
        self.socket.ensure_write(&header, 10)?;
        self.socket.ensure_write(payload, 10)?;
        Ok(())
    }

    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.send_frame(OP_BINARY, payload)
    }

    /// Sends a Close frame whose 2-byte payload carries `code` in network byte
    /// order, then shuts the socket down.
    pub fn close(&mut self, code: CloseCode) -> Result<()> {
        let mut payload = [0u8; 2];
        BigEndian::write_u16(&mut payload, code as u16);
        let _ = self.send_frame(OP_CLOSE, &payload);
        self.socket.shutdown();
        Ok(())
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn find_header_value(headers: &[u8], tag: &[u8]) -> Option<String> {
    for line in headers.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.len() >= tag.len() && line[..tag.len()].eq_ignore_ascii_case(tag) {
            let value = &line[tag.len()..];
            let trimmed = std::str::from_utf8(value).ok()?.trim();
            return Some(trimmed.to_string());
        }
    }
    None
}

fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    let digest = hasher.finalize();
    BASE64.encode(digest)
}
