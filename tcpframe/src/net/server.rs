use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use indexmap::IndexMap;
use slog::Logger;

use super::buffer::ByteBuffer;
use super::connection::Connection;
use super::error::Result;
use super::multiplex::Multiplexer;
use super::queue::WorkQueue;
use super::socket::Socket;
use super::websocket::WebSocketConnection;
use super::{ADDRESS_LENGTH, MAX_RETRIES};

/// One listening port this server should accept connections on.
pub struct ListenerSpec {
    pub port: u16,
    pub websocket: bool,
}

enum ConnectionKind {
    Tcp(Connection),
    WebSocket(WebSocketConnection),
}

impl ConnectionKind {
    fn poll_read(&mut self) -> Result<Vec<(Vec<u8>, bool)>> {
        let messages = match self {
            ConnectionKind::Tcp(c) => c
                .poll_read()?
                .into_iter()
                .map(|m| (m.data, m.closed))
                .collect(),
            ConnectionKind::WebSocket(w) => w
                .poll_read()?
                .into_iter()
                .map(|m| (m.data, m.closed))
                .collect(),
        };
        Ok(messages)
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            ConnectionKind::Tcp(c) => c.send(bytes),
            ConnectionKind::WebSocket(w) => w.send(bytes),
        }
    }

    fn raw_fd(&self) -> i32 {
        match self {
            ConnectionKind::Tcp(c) => c.socket().as_raw_fd(),
            ConnectionKind::WebSocket(w) => w.socket().as_raw_fd(),
        }
    }
}

/// Per-connection state handed to the handler: a stable id, the peer's
/// normalized address, and the framed connection itself, guarded by a mutex so
/// a worker's response send can never race the multiplexer thread's next read.
pub struct Client {
    pub id: u64,
    pub remote_addr: [u8; ADDRESS_LENGTH],
    kind: Mutex<ConnectionKind>,
}

impl Client {
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        self.kind.lock().unwrap().send(bytes)
    }
}

/// A decoded message waiting for a worker. Destroyed once the handler accepts
/// it or retries are exhausted.
pub struct Request {
    pub client: Arc<Client>,
    pub parameters: ByteBuffer,
    pub attempts: u8,
}

/// `(worker_index, client, category, method, params, response, state) -> handled`.
/// Returning `false` re-enqueues the request for another attempt, up to
/// `MAX_RETRIES` times.
pub type Handler<S> =
    dyn Fn(usize, &Arc<Client>, u8, u8, &mut ByteBuffer, &mut ByteBuffer, &S) -> bool + Send + Sync;

struct Listener {
    socket: Socket,
    websocket: bool,
}

/// Accepts connections on one or more ports, frames inbound bytes into
/// requests, and dispatches them to a fixed pool of worker threads.
pub struct RequestServer<S: Send + Sync + 'static> {
    running: Arc<AtomicBool>,
    multiplexer: Arc<Mutex<Multiplexer>>,
    accept_handles: Vec<JoinHandle<()>>,
    worker_handles: Vec<JoinHandle<()>>,
    queue: Arc<WorkQueue<Request>>,
    clients: Arc<Mutex<IndexMap<u64, Arc<Client>>>>,
    bound_ports: Vec<u16>,
    log: Logger,
    _state: std::marker::PhantomData<S>,
}

impl<S: Send + Sync + 'static> RequestServer<S> {
    pub fn new(
        specs: &[ListenerSpec],
        workers: u8,
        retry_code: u16,
        handler: Arc<Handler<S>>,
        state: Arc<S>,
        log: Logger,
    ) -> std::io::Result<RequestServer<S>> {
        let running = Arc::new(AtomicBool::new(true));
        let queue = Arc::new(WorkQueue::new());
        let clients: Arc<Mutex<IndexMap<u64, Arc<Client>>>> = Arc::new(Mutex::new(IndexMap::new()));
        let next_client_id = Arc::new(AtomicU64::new(1));
        let multiplexer = Arc::new(Mutex::new(Multiplexer::start(
            log.new(slog::o!("component" => "multiplex")),
        )));

        let mut listeners = Vec::with_capacity(specs.len());
        let mut bound_ports = Vec::with_capacity(specs.len());
        for spec in specs {
            let socket = Socket::listen(spec.port).map_err(to_io_error)?;
            bound_ports.push(socket.local_port()?);
            listeners.push(Listener {
                socket,
                websocket: spec.websocket,
            });
        }

        let mut accept_handles = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let running = Arc::clone(&running);
            let queue = Arc::clone(&queue);
            let clients = Arc::clone(&clients);
            let next_client_id = Arc::clone(&next_client_id);
            let multiplexer = Arc::clone(&multiplexer);
            let log = log.new(slog::o!("component" => "accept", "port" => listener.socket.local_port().unwrap_or(0)));

            let handle = thread::spawn(move || {
                accept_loop(listener, running, queue, clients, next_client_id, multiplexer, log);
            });
            accept_handles.push(handle);
        }

        let mut worker_handles = Vec::with_capacity(workers as usize);
        for index in 0..workers {
            let running = Arc::clone(&running);
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            let state = Arc::clone(&state);
            let log = log.new(slog::o!("component" => "worker", "worker" => index));

            let handle = thread::spawn(move || {
                worker_loop(index as usize, running, queue, handler, state, retry_code, log);
            });
            worker_handles.push(handle);
        }

        Ok(RequestServer {
            running,
            multiplexer,
            accept_handles,
            worker_handles,
            queue,
            clients,
            bound_ports,
            log,
            _state: std::marker::PhantomData,
        })
    }

    pub fn bound_ports(&self) -> &[u16] {
        &self.bound_ports
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn pending_requests(&self) -> usize {
        self.queue.len()
    }
}

impl<S: Send + Sync + 'static> Drop for RequestServer<S> {
    fn drop(&mut self) {
        slog::info!(self.log, "shutting down");
        self.running.store(false, Ordering::SeqCst);
        self.queue.kill_waiters();
        self.multiplexer.lock().unwrap().stop();

        for handle in self.accept_handles.drain(..) {
            let _ = handle.join();
        }
        for handle in self.worker_handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn to_io_error(err: super::error::Error) -> std::io::Error {
    match err {
        super::error::Error::Io(io_err) => io_err,
        other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
    }
}

#[allow(clippy::too_many_arguments)]
fn accept_loop(
    listener: Listener,
    running: Arc<AtomicBool>,
    queue: Arc<WorkQueue<Request>>,
    clients: Arc<Mutex<IndexMap<u64, Arc<Client>>>>,
    next_client_id: Arc<AtomicU64>,
    multiplexer: Arc<Mutex<Multiplexer>>,
    log: Logger,
) {
    while running.load(Ordering::SeqCst) {
        match listener.socket.accept() {
            Ok((socket, remote_addr)) => {
                let id = next_client_id.fetch_add(1, Ordering::SeqCst);
                let kind = if listener.websocket {
                    ConnectionKind::WebSocket(WebSocketConnection::new(socket))
                } else {
                    ConnectionKind::Tcp(Connection::new(socket))
                };
                let fd = kind.raw_fd();

                let client = Arc::new(Client {
                    id,
                    remote_addr,
                    kind: Mutex::new(kind),
                });
                clients.lock().unwrap().insert(id, Arc::clone(&client));

                slog::debug!(log, "client connected"; "client_id" => id);

                let read_queue = Arc::clone(&queue);
                let read_clients = Arc::clone(&clients);
                let read_log = log.new(slog::o!("client_id" => id));
                let read_client = Arc::clone(&client);

                multiplexer.lock().unwrap().register(
                    fd,
                    Box::new(move |_fd| on_readable(&read_client, &read_queue, &read_clients, &read_log)),
                );
            }
            Err(ref err) if transient(err) => continue,
            Err(err) => {
                slog::warn!(log, "accept failed, retrying"; "error" => err.to_string());
            }
        }
    }
}

fn transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

fn on_readable(
    client: &Arc<Client>,
    queue: &Arc<WorkQueue<Request>>,
    clients: &Arc<Mutex<IndexMap<u64, Arc<Client>>>>,
    log: &Logger,
) -> bool {
    let messages = {
        let mut kind = client.kind.lock().unwrap();
        kind.poll_read()
    };

    let messages = match messages {
        Ok(messages) => messages,
        Err(err) => {
            slog::debug!(log, "read error, dropping client"; "error" => err.to_string());
            clients.lock().unwrap().shift_remove(&client.id);
            return false;
        }
    };

    let mut keep = true;
    for (data, closed) in messages {
        if closed {
            slog::debug!(log, "client disconnected");
            clients.lock().unwrap().shift_remove(&client.id);
            keep = false;
            continue;
        }
        if data.is_empty() {
            continue;
        }
        let mut parameters = ByteBuffer::new();
        parameters.adopt(data);
        queue.enqueue(Request {
            client: Arc::clone(client),
            parameters,
            attempts: 0,
        });
    }
    keep
}

fn worker_loop<S: Send + Sync + 'static>(
    index: usize,
    running: Arc<AtomicBool>,
    queue: Arc<WorkQueue<Request>>,
    handler: Arc<Handler<S>>,
    state: Arc<S>,
    retry_code: u16,
    log: Logger,
) {
    let mut response = ByteBuffer::new();

    while running.load(Ordering::SeqCst) {
        let mut request = match queue.dequeue(Duration::from_millis(1000)) {
            Some(request) => request,
            None => continue,
        };

        if request.parameters.len() < 4 {
            slog::warn!(log, "dropping malformed request"; "client_id" => request.client.id);
            continue;
        }

        request.parameters.seek(0).ok();
        let id = match request.parameters.read_u16() {
            Ok(id) => id,
            Err(_) => continue,
        };
        let category = match request.parameters.read_u8() {
            Ok(v) => v,
            Err(_) => continue,
        };
        let method = match request.parameters.read_u8() {
            Ok(v) => v,
            Err(_) => continue,
        };

        response.clear_to_min();
        response.write_u16(id);

        let handled = handler(
            index,
            &request.client,
            category,
            method,
            &mut request.parameters,
            &mut response,
            &state,
        );

        if handled {
            if let Err(err) = request.client.send(response.as_slice()) {
                slog::debug!(log, "send failed"; "client_id" => request.client.id, "error" => err.to_string());
            }
        } else {
            request.attempts += 1;
            if request.attempts < MAX_RETRIES {
                queue.enqueue(request);
            } else {
                response.write_u16(retry_code);
                if let Err(err) = request.client.send(response.as_slice()) {
                    slog::debug!(log, "send failed"; "client_id" => request.client.id, "error" => err.to_string());
                }
            }
        }
    }
}
