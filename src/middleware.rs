use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderValue},
    response::Response,
};
use opentelemetry::propagation::Extractor;
use std::future::Future;
use tower::{Layer, Service};
use tracing::{Instrument, info, span, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::claims::generate_token_id;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    pub static REQUEST_CONTEXT: RequestContext;
}

/// Per-request details attached to every audit event.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub endpoint: String,
    pub host: String,
    pub method: String,
}

/// Runs `f` with the current request's context, or an empty one outside a
/// request (background tasks, unit tests).
pub fn with_request_info<F, R>(f: F) -> R
where
    F: Fn(&RequestContext) -> R,
{
    REQUEST_CONTEXT.try_with(|r| f(r)).unwrap_or_else(|_| {
        static DEFAULT_CTX: RequestContext = RequestContext {
            request_id: String::new(),
            endpoint: String::new(),
            host: String::new(),
            method: String::new(),
        };
        f(&DEFAULT_CTX)
    })
}

struct HeaderExtractor<'a> {
    headers: &'a HeaderMap,
}

impl<'a> Extractor for HeaderExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .get(key)
            .and_then(|header| header.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|h| h.as_str()).collect()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

/// Tower service that joins the caller's W3C trace, tags the request with an
/// id and scopes a [`RequestContext`] around the inner service.
#[derive(Debug, Clone)]
pub struct RequestContextService<S> {
    inner: S,
}

impl<S, ReqBody> Service<Request<ReqBody>> for RequestContextService<S>
where
    S: Service<Request<ReqBody>, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    // Instrumenting changes the future's type, so it is boxed.
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let parent_context = opentelemetry::global::get_text_map_propagator(|propagator| {
            propagator.extract(&HeaderExtractor {
                headers: req.headers(),
            })
        });

        let request_id = header_str(req.headers(), REQUEST_ID_HEADER)
            .filter(|id| !id.is_empty() && id.len() <= 128)
            .map(str::to_string)
            .unwrap_or_else(generate_token_id);
        let host = header_str(req.headers(), "x-forwarded-host")
            .or_else(|| header_str(req.headers(), "host"))
            .unwrap_or("")
            .to_string();

        let ctx = RequestContext {
            request_id,
            endpoint: req.uri().path().to_string(),
            host,
            method: req.method().to_string(),
        };

        let request_span = span!(
            tracing::Level::INFO,
            "request",
            request_id = %ctx.request_id,
            method = %ctx.method,
            endpoint = %ctx.endpoint,
        );

        if let Err(err) = request_span.set_parent(parent_context) {
            warn!(
                error = debug(err),
                "unable to set otel parent, span will be new instead"
            );
        }

        let started = Instant::now();
        let finished = ctx.clone();
        let fut = self.inner.call(req);
        Box::pin(async move {
            REQUEST_CONTEXT
                .scope(ctx, async move {
                    let response: Result<Self::Response, Self::Error> =
                        fut.instrument(request_span).await;

                    response.map(|mut res| {
                        if let Ok(value) = HeaderValue::from_str(&finished.request_id) {
                            res.headers_mut().insert(REQUEST_ID_HEADER, value);
                        }
                        info!(
                            audit = true,
                            auditType = "download",
                            requestId = %finished.request_id,
                            endpoint = %finished.endpoint,
                            host = %finished.host,
                            httpMethod = %finished.method,
                            status = res.status().as_u16(),
                            latencyMs = started.elapsed().as_millis() as u64,
                            "request to {} finished",
                            finished.endpoint
                        );
                        res
                    })
                })
                .await
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestContextLayer;

impl<S> Layer<S> for RequestContextLayer {
    type Service = RequestContextService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestContextService { inner }
    }
}
