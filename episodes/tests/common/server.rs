//! Minimal HTTP/1.1 server for integration tests.
//!
//! Serves fixed routes, each with its own status, body, content length policy and pacing, and counts the requests per path.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Route {
    pub status: u16,
    pub body: Vec<u8>,
    /// Declared length, `None` to omit the header and close the connection after the body.
    pub content_length: Option<usize>,
    /// Body pieces written with `delay` in between.
    pub pieces: usize,
    pub delay: Duration,
}

impl Route {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_length: Some(body.len()),
            body,
            pieces: 1,
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::ok(b"error".to_vec())
        }
    }

    pub fn html(page: &str) -> Self {
        Self::ok(page.as_bytes().to_vec())
    }

    pub fn without_length(self) -> Self {
        Self {
            content_length: None,
            ..self
        }
    }

    /// Declare `len` bytes whatever the actual body.
    pub fn with_declared_length(self, len: usize) -> Self {
        Self {
            content_length: Some(len),
            ..self
        }
    }

    pub fn paced(self, pieces: usize, delay: Duration) -> Self {
        Self {
            pieces: pieces.max(1),
            delay,
            ..self
        }
    }
}

#[derive(Debug, Clone)]
pub struct Server {
    base: String,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl Server {
    /// Starts a server in a background thread serving `routes` by path. It runs until the process exits.
    pub fn start(routes: impl IntoIterator<Item = (&'static str, Route)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();
        let routes: Arc<HashMap<String, Route>> =
            Arc::new(routes.into_iter().map(|(path, route)| (path.to_owned(), route)).collect());
        let hits = Arc::new(Mutex::new(HashMap::new()));

        let counter = Arc::clone(&hits);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let routes = Arc::clone(&routes);
                let counter = Arc::clone(&counter);
                thread::spawn(move || handle(stream, &routes, &counter));
            }
        });

        Self {
            base: format!("http://127.0.0.1:{port}"),
            hits,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }
}

fn handle(mut stream: TcpStream, routes: &HashMap<String, Route>, hits: &Mutex<HashMap<String, usize>>) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));

    let mut request = Vec::new();
    let mut buf = [0u8; 4096];
    while !request.windows(4).any(|window| window == b"\r\n\r\n") {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }

    let request = String::from_utf8_lossy(&request);
    let path = request.split_whitespace().nth(1).unwrap_or("/").to_owned();
    *hits.lock().unwrap().entry(path.clone()).or_default() += 1;

    let Some(route) = routes.get(&path) else {
        let _ = stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        return;
    };

    let mut head = format!("HTTP/1.1 {} Test\r\nConnection: close\r\n", route.status);
    if let Some(len) = route.content_length {
        head.push_str(&format!("Content-Length: {len}\r\n"));
    }
    head.push_str("\r\n");

    if stream.write_all(head.as_bytes()).is_err() {
        return;
    }

    let piece = route.body.len().div_ceil(route.pieces).max(1);
    for chunk in route.body.chunks(piece) {
        thread::sleep(route.delay);
        if stream.write_all(chunk).and_then(|()| stream.flush()).is_err() {
            return;
        }
    }
}
