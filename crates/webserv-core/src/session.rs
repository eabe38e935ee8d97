// src/session.rs
use crate::http::Request;
use crate::response::Response;
use std::collections::{HashSet, VecDeque};

pub const SESSION_COOKIE: &str = "session_id";
pub const MAX_SESSIONS: usize = 500;

/// Bounded set of issued session ids. The oldest id is evicted first.
pub struct SessionStore {
    order: VecDeque<String>,
    known: HashSet<String>,
    capacity: usize,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_SESSIONS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            known: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.known.contains(id)
    }

    /// Attach a fresh session cookie unless the request carries a known one.
    /// Runs once per connection, right before serialization.
    pub fn apply(&mut self, request: Option<&Request>, response: &mut Response) {
        let presented = request
            .and_then(|r| r.header("cookie"))
            .and_then(session_from_cookie);
        if let Some(id) = presented
            && self.contains(id)
        {
            return;
        }

        let id = self.issue();
        response.set_header(
            "Set-Cookie",
            format!("{}={}; Path=/; HttpOnly", SESSION_COOKIE, id),
        );
    }

    fn issue(&mut self) -> String {
        let id = loop {
            let candidate = generate_id();
            if !self.known.contains(&candidate) {
                break candidate;
            }
        };
        if self.order.len() >= self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.known.remove(&oldest);
        }
        self.order.push_back(id.clone());
        self.known.insert(id.clone());
        id
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_id() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Value of `session_id` in a `Cookie` header.
pub fn session_from_cookie(header: &str) -> Option<&str> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then_some(value)
    })
}
