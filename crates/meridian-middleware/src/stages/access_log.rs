//! Access log and request metrics.
//!
//! Emits one `info!` event per request after the rest of the chain has run,
//! plus the request counter and latency histogram.
//!
//! # Metrics Emitted
//!
//! - `meridian_requests_total{route,status}` - Counter of requests
//! - `meridian_request_duration_seconds{route}` - Histogram of latency
//! - `meridian_in_flight_requests` - Gauge of requests being processed

use meridian_core::{BoxFuture, Context, Handler, RequestId};

/// Access log middleware.
#[derive(Debug, Clone)]
pub struct AccessLog {
    service_name: String,
}

impl AccessLog {
    /// Creates the middleware for `service_name`.
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// The service name attached to every event.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

impl Default for AccessLog {
    fn default() -> Self {
        Self::new("meridian")
    }
}

impl Handler for AccessLog {
    fn name(&self) -> &'static str {
        "access_log"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            metrics::gauge!("meridian_in_flight_requests").increment(1.0);
            ctx.next().await;
            metrics::gauge!("meridian_in_flight_requests").decrement(1.0);

            let elapsed = ctx.elapsed();
            let status = ctx.status().as_u16();
            let route = ctx.route().unwrap_or("unmatched").to_string();

            metrics::counter!(
                "meridian_requests_total",
                "route" => route.clone(),
                "status" => status.to_string()
            )
            .increment(1);
            metrics::histogram!("meridian_request_duration_seconds", "route" => route.clone())
                .record(elapsed.as_secs_f64());

            let remote_ip = ctx.real_ip().map(|ip| ip.to_string());
            let error = ctx.error().map(ToString::to_string);
            tracing::info!(
                service = %self.service_name,
                request_id = ctx.request_id().map(RequestId::as_str),
                http.method = %ctx.request().method(),
                http.path = ctx.request().path(),
                http.protocol = ctx.request().protocol(),
                http.status = status,
                route = %route,
                size = ctx.size(),
                duration_ms = elapsed.as_secs_f64() * 1000.0,
                remote_ip = remote_ip.as_deref(),
                error = error.as_deref(),
                "request completed"
            );
        })
    }
}
