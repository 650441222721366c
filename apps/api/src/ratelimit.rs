//! Per-IP token-bucket rate limiting.
//!
//! Each (tier, client IP) pair owns an independent bucket so one client
//! cannot starve others. Buckets refill continuously at the tier's
//! per-minute rate and cap at the tier's burst size. An hourly sliding
//! window covers the expensive resume-generation path separately.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::state::AppState;

/// How aggressively an endpoint group is limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Credential mutation and password checks: 5/min, burst 3.
    Strict,
    /// Share-token issuance and validation: 10/min, burst 5.
    Moderate,
    /// General API traffic: 60/min, burst 10.
    Normal,
}

impl Tier {
    pub fn per_minute(self) -> u32 {
        match self {
            Tier::Strict => 5,
            Tier::Moderate => 10,
            Tier::Normal => 60,
        }
    }

    pub fn burst(self) -> u32 {
        match self {
            Tier::Strict => 3,
            Tier::Moderate => 5,
            Tier::Normal => 10,
        }
    }

    fn tokens_per_second(self) -> f64 {
        f64::from(self.per_minute()) / 60.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_epoch_s: u64,
    pub retry_after_s: u64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

pub struct RateLimiter {
    buckets: Mutex<HashMap<(Tier, String), Bucket>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, tier: Tier, ip: &str) -> Decision {
        self.allow_at(tier, ip, Instant::now())
    }

    fn allow_at(&self, tier: Tier, ip: &str, now: Instant) -> Decision {
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            // A poisoned lock means a panic elsewhere; fail open rather
            // than taking the whole API down with it.
            Err(poisoned) => poisoned.into_inner(),
        };
        let bucket = buckets
            .entry((tier, ip.to_string()))
            .or_insert_with(|| Bucket {
                tokens: f64::from(tier.burst()),
                last_refill: now,
                last_access: now,
            });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * tier.tokens_per_second()).min(f64::from(tier.burst()));
        bucket.last_refill = now;
        bucket.last_access = now;

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }
        let deficit = (1.0 - bucket.tokens).max(0.0);
        let secs_until_token = (deficit / tier.tokens_per_second()).ceil() as u64;
        let retry_after_s = if allowed { 0 } else { secs_until_token.max(1) };

        Decision {
            allowed,
            limit: tier.per_minute(),
            remaining: bucket.tokens.floor().max(0.0) as u32,
            reset_epoch_s: unix_now() + secs_until_token,
            retry_after_s,
        }
    }

    /// Drops buckets idle longer than the TTL. Returns how many were swept.
    pub fn sweep_idle(&self, ttl: Duration) -> usize {
        self.sweep_idle_at(ttl, Instant::now())
    }

    fn sweep_idle_at(&self, ttl: Duration, now: Instant) -> usize {
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = buckets.len();
        buckets.retain(|_, b| now.saturating_duration_since(b.last_access) < ttl);
        before - buckets.len()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Idle-bucket TTL enforced by the background sweeper.
pub const SWEEP_TTL: Duration = Duration::from_secs(600);
/// How often the sweeper runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

pub fn spawn_sweeper(
    limiter: Arc<RateLimiter>,
    window: Arc<HourlyWindow>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let swept = limiter.sweep_idle(SWEEP_TTL);
            let evicted = window.sweep_idle();
            if swept > 0 || evicted > 0 {
                debug!(swept, evicted, "Rate limiter swept idle state");
            }
        }
    })
}

/// Sliding one-hour window for the unauthenticated resume-generation path.
pub struct HourlyWindow {
    max_per_hour: usize,
    hits: Mutex<HashMap<String, Vec<Instant>>>,
}

impl HourlyWindow {
    pub fn new(max_per_hour: usize) -> Self {
        Self {
            max_per_hour,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, ip: &str) -> bool {
        self.allow_at(ip, Instant::now())
    }

    fn allow_at(&self, ip: &str, now: Instant) -> bool {
        let window = Duration::from_secs(3600);
        let mut hits = match self.hits.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = hits.entry(ip.to_string()).or_default();
        entry.retain(|t| now.saturating_duration_since(*t) < window);
        if entry.len() >= self.max_per_hour {
            return false;
        }
        entry.push(now);
        true
    }

    /// Drops per-IP entries whose hits have all aged out of the window.
    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Instant::now())
    }

    fn sweep_idle_at(&self, now: Instant) -> usize {
        let window = Duration::from_secs(3600);
        let mut hits = match self.hits.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = hits.len();
        hits.retain(|_, entry| {
            entry.retain(|t| now.saturating_duration_since(*t) < window);
            !entry.is_empty()
        });
        before - hits.len()
    }
}

/// Resolves the client IP. Proxy headers are honored only when TRUST_PROXY
/// is set; otherwise any client could spoof its way past the limiter.
pub fn client_ip(
    headers: &HeaderMap,
    transport: Option<&SocketAddr>,
    trust_proxy: bool,
) -> String {
    if trust_proxy {
        for name in ["cf-connecting-ip", "x-real-ip"] {
            if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
                let value = value.trim();
                if !value.is_empty() {
                    return strip_port(value);
                }
            }
        }
        if let Some(value) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            if let Some(first) = value.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return strip_port(first);
                }
            }
        }
    }
    match transport {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

/// Drops a trailing port from `ip` or `ip:port` or `[v6]:port` forms.
fn strip_port(addr: &str) -> String {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
    }
    // A single colon means v4:port; more means a bare IPv6 address.
    if addr.matches(':').count() == 1 {
        if let Some(host) = addr.split(':').next() {
            return host.to_string();
        }
    }
    addr.to_string()
}

/// Tower middleware enforcing one tier on a route group. Attached via
/// `middleware::from_fn_with_state((state, tier), enforce)`.
pub async fn enforce(
    State((state, tier)): State<(AppState, Tier)>,
    request: Request,
    next: Next,
) -> Response {
    let transport = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let ip = client_ip(request.headers(), transport.as_ref(), state.config.trust_proxy);
    let decision = state.limiter.allow(tier, &ip);

    if !decision.allowed {
        warn!(%ip, ?tier, "Rate limit exceeded");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "too many requests"})),
        )
            .into_response();
        apply_headers(response.headers_mut(), &decision);
        if let Ok(value) = decision.retry_after_s.to_string().parse() {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        return response;
    }

    let mut response = next.run(request).await;
    apply_headers(response.headers_mut(), &decision);
    response
}

fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    let pairs = [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_epoch_s.to_string()),
    ];
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (
            header::HeaderName::from_bytes(name.as_bytes()),
            value.parse(),
        ) {
            headers.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_deny() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        for _ in 0..3 {
            assert!(limiter.allow_at(Tier::Strict, "1.2.3.4", start).allowed);
        }
        let denied = limiter.allow_at(Tier::Strict, "1.2.3.4", start);
        assert!(!denied.allowed);
        assert!(denied.retry_after_s >= 1);
        assert_eq!(denied.limit, 5);
        assert_eq!(denied.remaining, 0);
    }

    #[test]
    fn test_refill_restores_capacity() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        for _ in 0..3 {
            limiter.allow_at(Tier::Strict, "1.2.3.4", start);
        }
        assert!(!limiter.allow_at(Tier::Strict, "1.2.3.4", start).allowed);
        // Strict refills one token every 12 seconds.
        let later = start + Duration::from_secs(13);
        assert!(limiter.allow_at(Tier::Strict, "1.2.3.4", later).allowed);
    }

    #[test]
    fn test_normal_tier_refills_within_a_second() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        for _ in 0..10 {
            assert!(limiter.allow_at(Tier::Normal, "1.2.3.4", start).allowed);
        }
        assert!(!limiter.allow_at(Tier::Normal, "1.2.3.4", start).allowed);
        // Normal refills one token per second.
        let later = start + Duration::from_millis(1200);
        assert!(limiter.allow_at(Tier::Normal, "1.2.3.4", later).allowed);
    }

    #[test]
    fn test_buckets_are_independent_per_ip_and_tier() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        for _ in 0..3 {
            limiter.allow_at(Tier::Strict, "1.2.3.4", start);
        }
        assert!(!limiter.allow_at(Tier::Strict, "1.2.3.4", start).allowed);
        assert!(limiter.allow_at(Tier::Strict, "5.6.7.8", start).allowed);
        assert!(limiter.allow_at(Tier::Normal, "1.2.3.4", start).allowed);
    }

    #[test]
    fn test_sweeper_drops_idle_buckets_only() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        limiter.allow_at(Tier::Normal, "1.2.3.4", start);
        limiter.allow_at(Tier::Normal, "5.6.7.8", start + Duration::from_secs(500));
        let swept = limiter.sweep_idle_at(SWEEP_TTL, start + Duration::from_secs(700));
        assert_eq!(swept, 1);
        // The surviving bucket kept its state: one token spent at t=500,
        // one refilled over the elapsed second, one spent now.
        let d = limiter.allow_at(Tier::Normal, "5.6.7.8", start + Duration::from_secs(501));
        assert!(d.allowed);
        assert_eq!(d.remaining, 9);
    }

    #[test]
    fn test_hourly_window() {
        let window = HourlyWindow::new(5);
        let start = Instant::now();
        for _ in 0..5 {
            assert!(window.allow_at("1.2.3.4", start));
        }
        assert!(!window.allow_at("1.2.3.4", start));
        assert!(window.allow_at("5.6.7.8", start));
        assert!(window.allow_at("1.2.3.4", start + Duration::from_secs(3601)));
    }

    #[test]
    fn test_hourly_window_sweeper_evicts_aged_out_ips() {
        let window = HourlyWindow::new(5);
        let start = Instant::now();
        window.allow_at("1.2.3.4", start);
        window.allow_at("5.6.7.8", start + Duration::from_secs(3000));

        let evicted = window.sweep_idle_at(start + Duration::from_secs(3601));
        assert_eq!(evicted, 1);
        // The surviving entry still counts its in-window hit.
        let hits = window.hits.lock().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits["5.6.7.8"].len(), 1);
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("1.2.3.4:8080"), "1.2.3.4");
        assert_eq!(strip_port("1.2.3.4"), "1.2.3.4");
        assert_eq!(strip_port("[::1]:443"), "::1");
        assert_eq!(strip_port("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn test_client_ip_header_precedence() {
        let transport: SocketAddr = "10.0.0.1:9999".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "2.2.2.2, 3.3.3.3".parse().unwrap());
        headers.insert("x-real-ip", "4.4.4.4".parse().unwrap());
        headers.insert("cf-connecting-ip", "5.5.5.5".parse().unwrap());

        assert_eq!(client_ip(&headers, Some(&transport), true), "5.5.5.5");
        headers.remove("cf-connecting-ip");
        assert_eq!(client_ip(&headers, Some(&transport), true), "4.4.4.4");
        headers.remove("x-real-ip");
        assert_eq!(client_ip(&headers, Some(&transport), true), "2.2.2.2");
        // Untrusted proxy headers are ignored entirely.
        assert_eq!(client_ip(&headers, Some(&transport), false), "10.0.0.1");
    }
}
