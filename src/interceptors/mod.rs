//! Interceptor chain
//!
//! Two priority-ordered lists around the mode handler: request interceptors
//! run highest-priority first before dispatch; response interceptors run
//! highest-priority first after it, and only for monitored requests. Each
//! interceptor is a trait object with `{name, priority, enabled}`; ordering
//! is a stable sort by priority descending, so same-priority interceptors
//! keep their registration order.
//!
//! Errors surface as failed requests: the chain invokes the failing
//! interceptor's `on_error` and rethrows to the caller.

mod request;
mod response;

pub use request::{
    HeaderNormalizationInterceptor, MobileHeadersInterceptor, RequestLoggingInterceptor,
    UserIdInterceptor,
};
pub use response::{
    CorsInterceptor, ErrorFormatInterceptor, JsonResponseInterceptor,
    ResponseLoggingInterceptor, SecurityHeadersInterceptor, StatsInterceptor,
};

use std::sync::Arc;

use anyhow::Result;

use crate::context::{RequestContext, ResponseContext};
use crate::stats::StatsAggregator;
use crate::traffic::TrafficConfig;

/// One link in the chain. Implementations override the hook they care about.
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;
    fn priority(&self) -> i32;
    fn enabled(&self) -> bool {
        true
    }
    fn on_request(&self, _ctx: &mut RequestContext) -> Result<()> {
        Ok(())
    }
    fn on_response(&self, _req: &RequestContext, _resp: &mut ResponseContext) -> Result<()> {
        Ok(())
    }
    /// Called when this interceptor's hook returned an error, before the
    /// chain rethrows it.
    fn on_error(&self, _req: &RequestContext, _err: &anyhow::Error) {}
}

pub struct InterceptorChain {
    request: Vec<Arc<dyn Interceptor>>,
    response: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new(
        mut request: Vec<Arc<dyn Interceptor>>,
        mut response: Vec<Arc<dyn Interceptor>>,
    ) -> Self {
        // stable: equal priorities keep registration order
        request.sort_by_key(|i| std::cmp::Reverse(i.priority()));
        response.sort_by_key(|i| std::cmp::Reverse(i.priority()));
        Self { request, response }
    }

    /// The standard chain in spec order.
    pub fn standard(traffic: Arc<TrafficConfig>, stats: Arc<StatsAggregator>) -> Self {
        Self::new(
            vec![
                Arc::new(UserIdInterceptor),
                Arc::new(MobileHeadersInterceptor::new(traffic)),
                Arc::new(HeaderNormalizationInterceptor),
                Arc::new(RequestLoggingInterceptor),
            ],
            vec![
                Arc::new(SecurityHeadersInterceptor),
                Arc::new(ErrorFormatInterceptor),
                Arc::new(CorsInterceptor),
                Arc::new(JsonResponseInterceptor),
                Arc::new(StatsInterceptor::new(stats)),
                Arc::new(ResponseLoggingInterceptor),
            ],
        )
    }

    /// Run the request stage. The first error is rethrown after `on_error`.
    pub fn run_request(&self, ctx: &mut RequestContext) -> Result<()> {
        for interceptor in self.request.iter().filter(|i| i.enabled()) {
            if let Err(err) = interceptor.on_request(ctx) {
                tracing::warn!("Request interceptor '{}' failed: {}", interceptor.name(), err);
                interceptor.on_error(ctx, &err);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Run the response stage. Callers skip this entirely for non-monitored
    /// requests.
    pub fn run_response(&self, req: &RequestContext, resp: &mut ResponseContext) -> Result<()> {
        for interceptor in self.response.iter().filter(|i| i.enabled()) {
            if let Err(err) = interceptor.on_response(req, resp) {
                tracing::warn!("Response interceptor '{}' failed: {}", interceptor.name(), err);
                interceptor.on_error(req, &err);
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn request_names(&self) -> Vec<&'static str> {
        self.request.iter().map(|i| i.name()).collect()
    }

    pub fn response_names(&self) -> Vec<&'static str> {
        self.response.iter().map(|i| i.name()).collect()
    }
}
