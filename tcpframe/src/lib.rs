pub mod net;

pub use net::buffer::ByteBuffer;
pub use net::error::{Error, Result};
pub use net::queue::WorkQueue;
pub use net::server::{Client, Handler, ListenerSpec, Request, RequestServer};
