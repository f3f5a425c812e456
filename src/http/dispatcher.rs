//! Request dispatch.
//!
//! Every call picks a [`Route`]. The cached route runs with a fresh
//! [`ExecutionContext`] whose auth cache is seeded with the Basic marker, so
//! credentials go out on the first request, and it consults the response
//! cache for plain GETs. The direct route sends the request bare and answers
//! a Basic challenge once from the credentials provider.

use crate::base::error::ClientError;
use crate::base::neterror::{NetError, NetFailure};
use crate::config::CacheSettings;
use crate::http::httpcache::{CacheEntry, HttpCache, Lookup};
use crate::http::request::{Request, RequestLine, Verb};
use crate::http::response::Response;
use crate::http::responsebody::ResponseBody;
use crate::http::streamfactory::{HttpStreamFactory, Transport};
use crate::http::transaction::HttpNetworkTransaction;
use crate::socket::authcache::{AuthCache, AuthScheme, AuthScope};
use http::header::{HeaderValue, IF_NONE_MATCH};
use http::StatusCode;

/// Which transport handle, and which request pipeline, a call goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Route {
    /// Preemptive auth and the response cache.
    #[default]
    Cached,
    /// No per-call context; auth only on challenge.
    Direct,
}

/// Per-call state for the cached route. Never shared between calls.
#[derive(Debug)]
pub struct ExecutionContext {
    scope: AuthScope,
    auth_cache: AuthCache,
}

impl ExecutionContext {
    pub fn new(factory: &HttpStreamFactory) -> Self {
        let scope = AuthScope::from(factory.endpoint());
        let auth_cache = if factory.credentials().is_some() {
            AuthCache::preemptive_basic(scope.clone())
        } else {
            AuthCache::new()
        };
        Self { scope, auth_cache }
    }

    pub fn auth_cache(&self) -> &AuthCache {
        &self.auth_cache
    }

    /// Preemptive `Authorization` value, if credentials are configured.
    pub fn authorization(&self, factory: &HttpStreamFactory) -> Option<HeaderValue> {
        let provider = factory.credentials()?;
        self.auth_cache.authorization(&self.scope, provider)
    }
}

/// Routes requests to the transport and wraps failures with call context.
#[derive(Debug)]
pub struct Dispatcher {
    transport: Transport,
    cache: Option<HttpCache>,
}

impl Dispatcher {
    pub fn new(transport: Transport, cache: Option<&CacheSettings>) -> Self {
        Self { transport, cache: cache.map(HttpCache::new) }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn cache(&self) -> Option<&HttpCache> {
        self.cache.as_ref()
    }

    /// Run one call. Any HTTP status is a successful outcome; only a missing
    /// response is an error.
    pub async fn execute(&self, request: Request, route: Route) -> Result<Response, ClientError> {
        let factory: &HttpStreamFactory = match route {
            Route::Cached => self.transport.primary().as_ref(),
            Route::Direct => self.transport.backend().as_ref(),
        };
        let line = request.request_line(factory.endpoint());
        let deadline = request.timeout();

        let exchange = async {
            match route {
                Route::Cached => self.send_cached(factory, request).await,
                Route::Direct => self.send_direct(factory, request).await,
            }
        };
        let result = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, exchange)
                .await
                .unwrap_or_else(|elapsed| Err(NetFailure::new(NetError::TimedOut, elapsed))),
            None => exchange.await,
        };

        if line.verb.is_unsafe() {
            if let Some(cache) = &self.cache {
                cache.invalidate(&line.path);
            }
        }

        match result {
            Ok(response) => {
                tracing::trace!(
                    method = %line.verb,
                    uri = %format_args!("{}{}", line.endpoint, line.path),
                    status = response.status_code(),
                    reason = response.reason(),
                    ?route,
                    "request completed"
                );
                Ok(response)
            }
            Err(failure) => {
                tracing::debug!(
                    request = %line,
                    endpoint = %line.endpoint,
                    error = %failure,
                    code = failure.kind().as_i32(),
                    "request failed"
                );
                Err(ClientError::Transport {
                    method: line.verb.to_string(),
                    path: line.path,
                    endpoint: line.endpoint.to_string(),
                    failure,
                })
            }
        }
    }

    async fn send_cached(
        &self,
        factory: &HttpStreamFactory,
        request: Request,
    ) -> Result<Response, NetFailure> {
        let context = ExecutionContext::new(factory);
        let authorization = context.authorization(factory);

        let cache = self
            .cache
            .as_ref()
            .filter(|_| request.verb() == Verb::Get && !request.has_caller_headers());
        let Some(cache) = cache else {
            return HttpNetworkTransaction::new(factory).start(request, authorization).await;
        };

        let line = request.request_line(factory.endpoint());
        let (request, unconditional) = match cache.lookup(request.path()) {
            Lookup::Fresh(entry) => {
                tracing::trace!(path = %line.path, "served from cache");
                return Ok(cached_response(entry, line));
            }
            Lookup::Revalidate(etag) => {
                let unconditional = request.try_clone();
                (request.with_header(IF_NONE_MATCH, etag), unconditional)
            }
            Lookup::Miss => (request, None),
        };

        let mut response =
            HttpNetworkTransaction::new(factory).start(request, authorization.clone()).await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            if let Some(unconditional) = unconditional {
                let entry = cache.update_from_not_modified(&line.path, response.headers());
                response.bytes().await?;
                if let Some(entry) = entry {
                    tracing::trace!(path = %line.path, "revalidated cached response");
                    return Ok(cached_response(entry, line));
                }
                // Entry went away while revalidating; the caller never sent a validator.
                tracing::trace!(path = %line.path, "cached response gone, fetching again");
                response =
                    HttpNetworkTransaction::new(factory).start(unconditional, authorization).await?;
            }
        }

        if cache.admits(response.status(), response.headers(), response.content_length()) {
            let body = response.take_body().unwrap_or_else(ResponseBody::empty).bytes().await?;
            cache.store(&line.path, response.headers(), body.clone());
            return Ok(response.with_body(ResponseBody::from_bytes(body)));
        }
        Ok(response)
    }

    async fn send_direct(
        &self,
        factory: &HttpStreamFactory,
        request: Request,
    ) -> Result<Response, NetFailure> {
        let provider = factory.credentials();
        let replay = provider.and_then(|_| request.try_clone());

        let response = HttpNetworkTransaction::new(factory).start(request, None).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let scope = AuthScope::from(factory.endpoint());
        let answer = AuthScheme::from_challenge(response.headers())
            .zip(provider)
            .and_then(|(scheme, provider)| provider.authorization(&scope, scheme));
        match (answer, replay) {
            (Some(authorization), Some(again)) => {
                tracing::debug!(request = %response.request(), "answering Basic challenge");
                // Drain so the connection goes back to the pool.
                let _ = response.bytes().await;
                HttpNetworkTransaction::new(factory).start(again, Some(authorization)).await
            }
            _ => Ok(response),
        }
    }
}

fn cached_response(entry: CacheEntry, line: RequestLine) -> Response {
    Response::new(StatusCode::OK, None, entry.headers, ResponseBody::from_bytes(entry.body), line)
}
