//! Admission Controller — per-route sliding-window quotas and request-shape
//! validation. Runs before any handler touches the registry or the queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::AppError;

pub mod validation;
pub mod window;

use window::{RateDecision, WindowCounter};

/// Quota for one route.
#[derive(Debug, Clone, Copy)]
pub struct RouteQuota {
    pub route: &'static str,
    pub limit: u32,
    pub window: Duration,
    pub message: &'static str,
}

impl RouteQuota {
    pub fn upload(config: &Config) -> Self {
        Self {
            route: "upload",
            limit: config.upload_rate_limit,
            window: config.rate_limit_window,
            message: "Too many uploads, please try again later",
        }
    }

    pub fn evaluate(config: &Config) -> Self {
        Self {
            route: "evaluate",
            limit: config.evaluate_rate_limit,
            window: config.rate_limit_window,
            message: "Too many evaluation requests, please try again later",
        }
    }
}

#[derive(Clone)]
pub struct AdmissionController {
    counter: Arc<dyn WindowCounter>,
    trust_forwarded_for: bool,
}

impl AdmissionController {
    pub fn new(counter: Arc<dyn WindowCounter>, trust_forwarded_for: bool) -> Self {
        Self {
            counter,
            trust_forwarded_for,
        }
    }

    /// Counts one request from `client` against `quota`.
    pub async fn admit(&self, quota: &RouteQuota, client: &str) -> Result<(), AppError> {
        let key = format!("ratelimit:{}:{}", quota.route, client);
        match self.counter.hit(&key, quota.limit, quota.window).await {
            Ok(RateDecision::Allowed { remaining }) => {
                debug!(route = quota.route, client, remaining, "Request admitted");
                Ok(())
            }
            Ok(RateDecision::Limited { retry_after }) => {
                warn!(route = quota.route, client, "Rate limit exceeded");
                Err(AppError::RateLimited {
                    retry_after,
                    message: quota.message.to_string(),
                })
            }
            // The quota protects the scoring backend, not data integrity: admit
            // when the counter store is unreachable.
            Err(e) => {
                warn!(route = quota.route, "Rate limit check failed, admitting request: {e}");
                Ok(())
            }
        }
    }

    /// Client identity: first `X-Forwarded-For` hop when trusted, else the peer IP.
    pub fn client_identity(&self, req: &Request) -> String {
        if self.trust_forwarded_for {
            let forwarded = req
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(ip) = forwarded {
                return ip.to_string();
            }
        }
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Middleware state binding a controller to one route's quota.
#[derive(Clone)]
pub struct QuotaGate {
    pub admission: AdmissionController,
    pub quota: RouteQuota,
}

pub async fn enforce_quota(State(gate): State<QuotaGate>, req: Request, next: Next) -> Response {
    let client = gate.admission.client_identity(&req);
    match gate.admission.admit(&gate.quota, &client).await {
        Ok(()) => next.run(req).await,
        Err(err) => err.into_response(),
    }
}
