mod config;

use std::sync::Arc;

use slog::Drain;
use tcpframe::{ByteBuffer, Client, Handler, ListenerSpec, RequestServer};

use config::ServerConfig;

/// `category` selects a demo feature; `method` selects an operation within it.
/// Category 0 is the only one implemented: method 0 echoes the request body
/// back verbatim, method 1 echoes it reversed.
fn dispatch(
    _worker_index: usize,
    _client: &Arc<Client>,
    category: u8,
    method: u8,
    params: &mut ByteBuffer,
    response: &mut ByteBuffer,
    _state: &(),
) -> bool {
    let remaining = params.len() - params.cursor();
    let body = params.read(remaining).unwrap_or(&[]).to_vec();

    match (category, method) {
        (0, 0) => {
            response.write_u8(category);
            response.write_u8(method);
            response.write(&body);
        }
        (0, 1) => {
            response.write_u8(category);
            response.write_u8(method);
            response.write(&body.into_iter().rev().collect::<Vec<u8>>());
        }
        _ => {
            response.write_u8(category);
            response.write_u8(method);
        }
    }

    true
}

fn init_logger(level: &str) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let min_level = match level {
        "trace" => slog::Level::Trace,
        "debug" => slog::Level::Debug,
        "warning" | "warn" => slog::Level::Warning,
        "error" => slog::Level::Error,
        _ => slog::Level::Info,
    };
    let drain = slog::LevelFilter::new(drain, min_level).fuse();
    slog::Logger::root(drain, slog::o!("app" => "tcpframe-echo"))
}

fn main() {
    let config = ServerConfig::load();
    let log = init_logger(&config.log_level);

    let specs: Vec<ListenerSpec> = config
        .listeners
        .iter()
        .map(|l| ListenerSpec {
            port: l.port,
            websocket: l.websocket,
        })
        .collect();

    let handler: Arc<Handler<()>> = Arc::new(dispatch);

    let server = RequestServer::new(&specs, config.workers, config.retry_code, handler, Arc::new(()), log.clone())
        .expect("failed to start request server");

    slog::info!(log, "tcpframe-echo listening"; "ports" => ?server.bound_ports());

    loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
    }
}
