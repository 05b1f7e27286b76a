use crate::config::RateLimitConfig;
use crate::error::GatewayError;
use crate::proxy::context::RequestContext;
use dashmap::DashMap;
use http::StatusCode;
use std::borrow::Cow;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::FilterResult;

/// Keys idle for longer than this are dropped by the GC task.
const IDLE_EXPIRY: Duration = Duration::from_secs(300);
const GC_INTERVAL: Duration = Duration::from_secs(60);
/// Hard cap on tracked keys; the least recently used beyond it are dropped.
const MAX_KEYS: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Policy {
    /// `capacity` tokens, refilled continuously at `refill_per_sec`.
    TokenBucket { capacity: f64, refill_per_sec: f64 },
    /// At most `limit` requests per `window`, with the previous window
    /// weighted in so a boundary does not admit two full windows at once.
    SlidingWindow { limit: u64, window: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeySource {
    Route,
    RemoteAddr,
    Uri,
    HostUri,
}

/// Per-route request limiter, compiled once from the route's filter config.
///
/// Each key owns a meter behind its own `tokio::sync::Mutex`, so callers
/// for different keys never contend and callers for the same key see each
/// other's consumption in order.
pub struct RateLimiter {
    policy: Policy,
    key: KeySource,
    rejected: StatusCode,
    meters: DashMap<String, Arc<KeyMeter>>,
    epoch: Instant,
}

struct KeyMeter {
    state: Mutex<Meter>,
    /// Milliseconds since the limiter's epoch, read by GC without the lock.
    touched_ms: AtomicU64,
}

enum Meter {
    Bucket {
        tokens: f64,
        last_refill: Instant,
    },
    Window {
        current: u64,
        previous: u64,
        started: Instant,
    },
}

impl RateLimiter {
    pub fn from_config(config: &RateLimitConfig) -> Result<Self, String> {
        let policy = match config.mode.as_str() {
            "req" => {
                let rate = config.rate.unwrap_or(100.0);
                if rate.is_nan() || rate <= 0.0 {
                    return Err(format!("rate_limit rate must be positive, got {}", rate));
                }
                let capacity = config.burst.map_or(rate, |b| b as f64).max(1.0);
                Policy::TokenBucket {
                    capacity,
                    refill_per_sec: rate,
                }
            }
            "count" | "sliding_window" => {
                let limit = config.count.unwrap_or(1000);
                let window_secs = config.time_window.unwrap_or(1);
                if limit == 0 || window_secs == 0 {
                    return Err("rate_limit count and time_window must be > 0".into());
                }
                Policy::SlidingWindow {
                    limit,
                    window: Duration::from_secs(window_secs),
                }
            }
            other => return Err(format!("unknown rate_limit mode '{}'", other)),
        };

        let key = match config.key.as_str() {
            "route" => KeySource::Route,
            "remote_addr" => KeySource::RemoteAddr,
            "uri" => KeySource::Uri,
            "host_uri" => KeySource::HostUri,
            other => return Err(format!("unknown rate_limit key '{}'", other)),
        };

        let rejected = StatusCode::from_u16(config.rejected_code)
            .map_err(|_| format!("invalid rate_limit rejected_code {}", config.rejected_code))?;

        Ok(Self {
            policy,
            key,
            rejected,
            meters: DashMap::new(),
            epoch: Instant::now(),
        })
    }

    pub fn mode(&self) -> &'static str {
        match self.policy {
            Policy::TokenBucket { .. } => "req",
            Policy::SlidingWindow { .. } => "count",
        }
    }

    /// Consume one unit for `key`. Returns `false` when the key is over its
    /// limit.
    pub async fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let meter = self.meter(key, now);
        meter
            .touched_ms
            .store(self.millis_since_epoch(now), Ordering::Relaxed);

        let mut state = meter.state.lock().await;
        state.try_consume(self.policy, Instant::now())
    }

    /// The bucket key for a request, per the configured key source.
    fn key_for<'a>(&self, ctx: &'a RequestContext) -> Cow<'a, str> {
        request_key(
            self.key,
            &ctx.route_id,
            &ctx.host,
            &ctx.uri_path,
            &ctx.client_ip,
        )
    }

    fn meter(&self, key: &str, now: Instant) -> Arc<KeyMeter> {
        if let Some(meter) = self.meters.get(key) {
            return meter.value().clone();
        }
        self.meters
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(KeyMeter {
                    state: Mutex::new(Meter::fresh(self.policy, now)),
                    touched_ms: AtomicU64::new(self.millis_since_epoch(now)),
                })
            })
            .clone()
    }

    fn millis_since_epoch(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// Spawn the idle-key GC. The task holds only a weak reference and exits
    /// once the route table that owns this limiter is replaced. No-op outside
    /// a tokio runtime.
    pub fn start_gc(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        handle.spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(limiter) = weak.upgrade() else { break };
                limiter.collect_idle(Instant::now());
            }
        });
    }

    fn collect_idle(&self, now: Instant) {
        let now_ms = self.millis_since_epoch(now);
        let expiry_ms = IDLE_EXPIRY.as_millis() as u64;
        self.meters
            .retain(|_, m| now_ms.saturating_sub(m.touched_ms.load(Ordering::Relaxed)) < expiry_ms);

        let overflow = self.meters.len().saturating_sub(MAX_KEYS);
        if overflow == 0 {
            return;
        }
        let mut by_age: Vec<(String, u64)> = self
            .meters
            .iter()
            .map(|m| (m.key().clone(), m.touched_ms.load(Ordering::Relaxed)))
            .collect();
        by_age.sort_unstable_by_key(|(_, touched)| *touched);
        for (key, _) in by_age.into_iter().take(overflow) {
            self.meters.remove(&key);
        }
        tracing::debug!("filter: rate_limit: dropped {} keys over cap", overflow);
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.meters.len()
    }
}

impl Meter {
    fn fresh(policy: Policy, now: Instant) -> Self {
        match policy {
            Policy::TokenBucket { capacity, .. } => Meter::Bucket {
                tokens: capacity,
                last_refill: now,
            },
            Policy::SlidingWindow { .. } => Meter::Window {
                current: 0,
                previous: 0,
                started: now,
            },
        }
    }

    fn try_consume(&mut self, policy: Policy, now: Instant) -> bool {
        match (self, policy) {
            (
                Meter::Bucket {
                    tokens,
                    last_refill,
                },
                Policy::TokenBucket {
                    capacity,
                    refill_per_sec,
                },
            ) => {
                let elapsed = now.saturating_duration_since(*last_refill).as_secs_f64();
                *tokens = (*tokens + elapsed * refill_per_sec).min(capacity);
                *last_refill = now;
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    true
                } else {
                    false
                }
            }
            (
                Meter::Window {
                    current,
                    previous,
                    started,
                },
                Policy::SlidingWindow { limit, window },
            ) => {
                let mut into = now.saturating_duration_since(*started);
                if into >= window {
                    // One full idle window empties the carried-over count.
                    *previous = if into >= window * 2 { 0 } else { *current };
                    *current = 0;
                    let skipped = (into.as_nanos() / window.as_nanos()) as u32;
                    *started += window * skipped;
                    into = now.saturating_duration_since(*started);
                }
                let carried = 1.0 - into.as_secs_f64() / window.as_secs_f64();
                let estimate = (*previous as f64 * carried) as u64 + *current;
                if estimate < limit {
                    *current += 1;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

/// - `Route`: one counter for the whole route
/// - `RemoteAddr`: per client IP
/// - `Uri`: per request path
/// - `HostUri`: per host and path
fn request_key<'a>(
    source: KeySource,
    route_id: &'a str,
    host: &'a str,
    uri: &'a str,
    client_ip: &IpAddr,
) -> Cow<'a, str> {
    match source {
        KeySource::Route => Cow::Borrowed(route_id),
        KeySource::RemoteAddr => Cow::Owned(client_ip.to_string()),
        KeySource::Uri => Cow::Borrowed(uri),
        KeySource::HostUri => {
            let mut s = String::with_capacity(host.len() + uri.len());
            s.push_str(host);
            s.push_str(uri);
            Cow::Owned(s)
        }
    }
}

pub(super) async fn rate_limit_on_request(
    limiter: &RateLimiter,
    ctx: &mut RequestContext,
) -> FilterResult {
    let key = limiter.key_for(ctx);
    let allowed = limiter.check(&key).await;

    if !allowed {
        tracing::debug!(
            "filter: rate_limit: rejected, route={}, key={}",
            ctx.route_id,
            key
        );
        metrics::counter!(
            "waypoint_rate_limit_rejected_total",
            "route" => ctx.route_id.clone(),
            "mode" => limiter.mode(),
        )
        .increment(1);

        let mut resp = ctx.error_response(&GatewayError::RateLimited);
        *resp.status_mut() = limiter.rejected;
        return FilterResult::Reject(resp);
    }

    metrics::counter!(
        "waypoint_rate_limit_allowed_total",
        "route" => ctx.route_id.clone(),
        "mode" => limiter.mode(),
    )
    .increment(1);
    FilterResult::Continue
}
