use super::error::Result;
use super::socket::Socket;
use super::{MESSAGE_LENGTH_BYTES, MESSAGE_MAX_SIZE};

/// One whole decoded application message, or a close signal.
pub struct Message {
    pub data: Vec<u8>,
    pub closed: bool,
}

impl Message {
    fn closed() -> Message {
        Message {
            data: Vec::new(),
            closed: true,
        }
    }
}

/// A connection framed with a 16-bit little-endian length prefix per message:
/// `u16_le length || payload`. Bytes accumulate in a fixed `MESSAGE_MAX_SIZE`
/// buffer; `poll_read` drains the socket once and returns every whole message
/// that became available as a result.
pub struct Connection {
    socket: Socket,
    buffer: Vec<u8>,
    bytes_received: usize,
}

impl Connection {
    pub fn new(socket: Socket) -> Connection {
        Connection {
            socket,
            buffer: vec![0u8; MESSAGE_MAX_SIZE],
            bytes_received: 0,
        }
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    /// Reads once from the socket and decodes every whole message the new bytes
    /// complete. A zero-byte read means the peer disconnected.
    pub fn poll_read(&mut self) -> Result<Vec<Message>> {
        let read = self
            .socket
            .read(&mut self.buffer[self.bytes_received..])?;

        if read == 0 {
            return Ok(vec![Message::closed()]);
        }
        self.bytes_received += read;

        let mut messages = Vec::new();
        loop {
            if self.bytes_received < MESSAGE_LENGTH_BYTES {
                break;
            }
            let length =
                u16::from_le_bytes([self.buffer[0], self.buffer[1]]) as usize;
            let frame_len = MESSAGE_LENGTH_BYTES + length;
            if self.bytes_received < frame_len {
                break;
            }

            let data = self.buffer[MESSAGE_LENGTH_BYTES..frame_len].to_vec();
            self.buffer.copy_within(frame_len..self.bytes_received, 0);
            self.bytes_received -= frame_len;

            if length == 0 {
                messages.push(Message::closed());
                break;
            }
            messages.push(Message { data, closed: false });
        }

        Ok(messages)
    }

    /// Sends raw bytes unchanged; the caller is responsible for any length prefix.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let sent = self.socket.ensure_write(bytes, 10)?;
        if sent < bytes.len() {
            return Err(super::error::Error::Disconnected);
        }
        Ok(())
    }
}
