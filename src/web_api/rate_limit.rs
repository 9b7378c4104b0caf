use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http::{header::RETRY_AFTER, HeaderValue};
use tracing::warn;

use super::ApiError;

pub const WINDOW: Duration = Duration::from_secs(60);
pub const MAX_REQUESTS: u32 = 120;
/// Tracked clients before expired windows are pruned
const CAPACITY: usize = 16_384;

/// Fixed-window request counter keyed by client address
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    capacity: usize,
    clients: Mutex<HashMap<IpAddr, Window>>,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    hits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u32, reset: Duration },
    Limited { reset: Duration },
}

impl Default for RateLimiter {
    fn default() -> Self {
        RateLimiter::new(WINDOW, MAX_REQUESTS, CAPACITY)
    }
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32, capacity: usize) -> RateLimiter {
        RateLimiter {
            window,
            max_requests,
            capacity: capacity.max(1),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, client: IpAddr) -> Decision {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: IpAddr, now: Instant) -> Decision {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);

        if clients.len() >= self.capacity && !clients.contains_key(&client) {
            clients.retain(|_, w| now.duration_since(w.started) < self.window);
            if clients.len() >= self.capacity {
                if let Some(oldest) = clients
                    .iter()
                    .min_by_key(|(_, w)| w.started)
                    .map(|(ip, _)| *ip)
                {
                    clients.remove(&oldest);
                }
            }
        }

        let window = clients.entry(client).or_insert(Window {
            started: now,
            hits: 0,
        });
        if now.duration_since(window.started) >= self.window {
            *window = Window {
                started: now,
                hits: 0,
            };
        }

        let reset = self.window.saturating_sub(now.duration_since(window.started));
        if window.hits >= self.max_requests {
            Decision::Limited { reset }
        } else {
            window.hits += 1;
            Decision::Allowed {
                remaining: self.max_requests - window.hits,
                reset,
            }
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

/// Middleware counting every request against its source address. Without connection info
/// (e.g. served without `into_make_service_with_connect_info`) all callers share one bucket.
pub async fn limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    let decision = limiter.check(client);
    let (mut response, remaining, reset) = match decision {
        Decision::Allowed { remaining, reset } => (next.run(request).await, remaining, reset),
        Decision::Limited { reset } => {
            warn!("Rate limited {client}");
            (ApiError::RateLimited.into_response(), 0, reset)
        }
    };

    let headers = response.headers_mut();
    headers.insert("ratelimit-limit", HeaderValue::from(limiter.max_requests));
    headers.insert("ratelimit-remaining", HeaderValue::from(remaining));
    headers.insert("ratelimit-reset", HeaderValue::from(ceil_secs(reset)));
    if let Decision::Limited { .. } = decision {
        headers.insert(RETRY_AFTER, HeaderValue::from(ceil_secs(reset)));
    }
    response
}
