//! Servlet dispatch: exact paths first, then glob patterns in insertion
//! order, then the default (404) servlet.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::{Arc, RwLock};

use crate::http::proto::{Request, Response};
use crate::http::session::Session;

/// A handler for one HTTP path. Returns 0 when the request was handled
/// normally; any other value is logged by the server.
pub trait Servlet: Send + Sync {
    fn name(&self) -> &str;
    fn handle(&self, request: &Request, response: &mut Response, session: &Session) -> i32;
}

/// Wraps a closure as a servlet.
pub struct FunctionServlet<F> {
    name: String,
    callback: F,
}

impl<F> FunctionServlet<F>
where
    F: Fn(&Request, &mut Response, &Session) -> i32 + Send + Sync,
{
    pub fn new(name: &str, callback: F) -> FunctionServlet<F> {
        FunctionServlet {
            name: name.into(),
            callback,
        }
    }
}

impl<F> Servlet for FunctionServlet<F>
where
    F: Fn(&Request, &mut Response, &Session) -> i32 + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, request: &Request, response: &mut Response, session: &Session) -> i32 {
        (self.callback)(request, response, session)
    }
}

/// The catch-all 404 servlet.
pub struct NotFoundServlet {
    name: String,
    content: String,
}

impl NotFoundServlet {
    pub fn new(server: &str) -> NotFoundServlet {
        NotFoundServlet {
            name: "NotFoundServlet".into(),
            content: format!(
                "<html><head><title>404 Not Found</title></head>\
                 <body><center><h1>404 Not Found</h1></center>\
                 <hr><center>{}</center></body></html>",
                server
            ),
        }
    }
}

impl Servlet for NotFoundServlet {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, _request: &Request, response: &mut Response, _session: &Session) -> i32 {
        response.status = 404;
        response.set_header("Content-Type", "text/html");
        response.body = self.content.clone();
        0
    }
}

struct DispatchInner {
    exact: HashMap<String, Arc<dyn Servlet>>,
    globs: Vec<(String, Arc<dyn Servlet>)>,
}

/// The routing table. Lookups take the read lock only.
pub struct ServletDispatch {
    inner: RwLock<DispatchInner>,
    default: RwLock<Arc<dyn Servlet>>,
}

impl ServletDispatch {
    pub fn new(server: &str) -> ServletDispatch {
        ServletDispatch {
            inner: RwLock::new(DispatchInner {
                exact: HashMap::new(),
                globs: Vec::new(),
            }),
            default: RwLock::new(Arc::new(NotFoundServlet::new(server))),
        }
    }

    pub fn add_servlet(&self, path: &str, servlet: Arc<dyn Servlet>) {
        self.inner
            .write()
            .expect("dispatch lock poisoned")
            .exact
            .insert(path.into(), servlet);
    }

    pub fn add_function(
        &self,
        path: &str,
        callback: impl Fn(&Request, &mut Response, &Session) -> i32 + Send + Sync + 'static,
    ) {
        self.add_servlet(path, Arc::new(FunctionServlet::new(path, callback)));
    }

    /// Registers under a glob pattern (`*`, `?`, `[...]` of fnmatch(3)).
    pub fn add_glob_servlet(&self, pattern: &str, servlet: Arc<dyn Servlet>) {
        let mut inner = self.inner.write().expect("dispatch lock poisoned");
        inner.globs.retain(|(p, _)| p != pattern);
        inner.globs.push((pattern.into(), servlet));
    }

    pub fn add_glob_function(
        &self,
        pattern: &str,
        callback: impl Fn(&Request, &mut Response, &Session) -> i32 + Send + Sync + 'static,
    ) {
        self.add_glob_servlet(pattern, Arc::new(FunctionServlet::new(pattern, callback)));
    }

    pub fn del_servlet(&self, path: &str) {
        self.inner
            .write()
            .expect("dispatch lock poisoned")
            .exact
            .remove(path);
    }

    pub fn del_glob_servlet(&self, pattern: &str) {
        self.inner
            .write()
            .expect("dispatch lock poisoned")
            .globs
            .retain(|(p, _)| p != pattern);
    }

    pub fn set_default(&self, servlet: Arc<dyn Servlet>) {
        *self.default.write().expect("dispatch lock poisoned") = servlet;
    }

    pub fn default_servlet(&self) -> Arc<dyn Servlet> {
        self.default.read().expect("dispatch lock poisoned").clone()
    }

    /// Exact match first, then the globs in insertion order, then default.
    pub fn find(&self, path: &str) -> Arc<dyn Servlet> {
        {
            let inner = self.inner.read().expect("dispatch lock poisoned");
            if let Some(servlet) = inner.exact.get(path) {
                return servlet.clone();
            }
            for (pattern, servlet) in &inner.globs {
                if glob_match(pattern, path) {
                    return servlet.clone();
                }
            }
        }
        self.default_servlet()
    }

    pub fn handle(&self, request: &Request, response: &mut Response, session: &Session) -> i32 {
        self.find(&request.path).handle(request, response, session)
    }
}

/// fnmatch(3) with default flags.
fn glob_match(pattern: &str, path: &str) -> bool {
    let (pattern, path) = match (CString::new(pattern), CString::new(path)) {
        (Ok(pattern), Ok(path)) => (pattern, path),
        _ => return false,
    };
    // SAFETY: both arguments are NUL-terminated C strings.
    unsafe { libc::fnmatch(pattern.as_ptr(), path.as_ptr(), 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TagServlet(&'static str);

    impl Servlet for TagServlet {
        fn name(&self) -> &str {
            self.0
        }

        fn handle(&self, _: &Request, response: &mut Response, _: &Session) -> i32 {
            response.body = self.0.to_string();
            0
        }
    }

    #[test]
    fn exact_wins_over_glob() {
        let dispatch = ServletDispatch::new("test/1.0");
        dispatch.add_servlet("/api/ping", Arc::new(TagServlet("exact")));
        dispatch.add_glob_servlet("/api/*", Arc::new(TagServlet("glob")));
        assert_eq!(dispatch.find("/api/ping").name(), "exact");
        assert_eq!(dispatch.find("/api/other").name(), "glob");
    }

    #[test]
    fn globs_match_in_insertion_order() {
        let dispatch = ServletDispatch::new("test/1.0");
        dispatch.add_glob_servlet("/a/*", Arc::new(TagServlet("first")));
        dispatch.add_glob_servlet("/a/b*", Arc::new(TagServlet("second")));
        // Both patterns match; the first registered wins.
        assert_eq!(dispatch.find("/a/bc").name(), "first");
    }

    #[test]
    fn unmatched_path_falls_through_to_default() {
        let dispatch = ServletDispatch::new("test/1.0");
        assert_eq!(dispatch.find("/nope").name(), "NotFoundServlet");
    }

    #[test]
    fn glob_question_mark() {
        let dispatch = ServletDispatch::new("test/1.0");
        dispatch.add_glob_servlet("/v?/status", Arc::new(TagServlet("v")));
        assert_eq!(dispatch.find("/v1/status").name(), "v");
        assert_eq!(dispatch.find("/v12/status").name(), "NotFoundServlet");
    }

    #[test]
    fn del_servlet_unregisters() {
        let dispatch = ServletDispatch::new("test/1.0");
        dispatch.add_servlet("/x", Arc::new(TagServlet("x")));
        dispatch.del_servlet("/x");
        assert_eq!(dispatch.find("/x").name(), "NotFoundServlet");
    }
}
