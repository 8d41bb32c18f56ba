//! HTTP/1.1 server and client.
//!
//! [`proto`] holds the wire entities, [`parser`] the incremental parsers.
//! The server side reads requests through a [`session::Session`] and routes
//! them with a [`servlet::ServletDispatch`]; the client side speaks through
//! [`connection::Connection`]s, usually borrowed from a bounded
//! [`connection::Pool`]. [`ws`] covers the WebSocket upgrade handshake.

pub mod connection;
pub mod parser;
pub mod proto;
pub mod server;
pub mod servlet;
pub mod session;
pub mod ws;

pub use connection::{Connection, HttpResult, Pool, ResultCode};
pub use proto::{Method, Request, Response};
pub use server::HttpServer;
pub use servlet::{FunctionServlet, Servlet, ServletDispatch};
pub use session::Session;
