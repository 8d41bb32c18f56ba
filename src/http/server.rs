//! HTTP server: a session loop on the TCP server scaffold.

use std::sync::Arc;

use log::{debug, warn};

use crate::http::servlet::ServletDispatch;
use crate::http::session::Session;
use crate::io::IoManager;
use crate::socket::Socket;
use crate::tcp_server::{ClientHandler, TcpServer};

const SERVER_NAME: &str = "strand/0.4.0";

struct HttpHandler {
    dispatch: Arc<ServletDispatch>,
    keep_alive: bool,
    name: String,
}

impl ClientHandler for HttpHandler {
    /// recv -> dispatch -> send until the peer asks to close, keep-alive is
    /// off, or the transport fails.
    fn handle_client(&self, client: Socket) {
        let session = Session::new(Arc::new(client), true);
        loop {
            let request = match session.recv_request() {
                Ok(req) => req,
                Err(e) => {
                    debug!("{}: session ended: {}", self.name, e);
                    break;
                }
            };
            let close = request.is_close() || !self.keep_alive;

            let mut response = request.create_response();
            response.set_close(close);
            response.set_header("Server", &self.name);
            let rc = self.dispatch.handle(&request, &mut response, &session);
            if rc != 0 {
                warn!(
                    "{}: servlet for {:?} returned {}",
                    self.name, request.path, rc
                );
            }
            if session.send_response(&response).is_err() {
                break;
            }
            if close {
                break;
            }
        }
        session.close();
    }
}

/// An HTTP/1.1 server with servlet routing.
pub struct HttpServer {
    tcp: Arc<TcpServer>,
    dispatch: Arc<ServletDispatch>,
}

impl HttpServer {
    pub fn new(
        worker: Arc<IoManager>,
        accept_worker: Arc<IoManager>,
        keep_alive: bool,
    ) -> HttpServer {
        let dispatch = Arc::new(ServletDispatch::new(SERVER_NAME));
        let handler = Arc::new(HttpHandler {
            dispatch: dispatch.clone(),
            keep_alive,
            name: SERVER_NAME.into(),
        });
        HttpServer {
            tcp: TcpServer::new(SERVER_NAME, worker, accept_worker, handler),
            dispatch,
        }
    }

    /// The routing table; register servlets here.
    #[inline(always)]
    pub fn dispatch(&self) -> &Arc<ServletDispatch> {
        &self.dispatch
    }

    #[inline(always)]
    pub fn tcp(&self) -> &Arc<TcpServer> {
        &self.tcp
    }

    pub fn bind(&self, addrs: &[crate::address::Address]) -> Result<(), Vec<crate::address::Address>> {
        self.tcp.bind(addrs)
    }

    pub fn start(&self) {
        self.tcp.start();
    }

    pub fn stop(&self) {
        self.tcp.stop();
    }
}
