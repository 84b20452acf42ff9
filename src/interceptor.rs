//! The interceptor chain that flows a request through the cache
//! strategy, the connection pool, and the transport engine (spec.md §2,
//! §6).
//!
//! [`Chain`] carries an explicit position index rather than allocating a
//! new sub-chain object per step (`SPEC_FULL.md` §9's "nested
//! interceptor recursion → iterative chain" design note), so stack depth
//! is bounded by the number of installed interceptors rather than by
//! anything request-dependent. The final step — invoking the transport
//! engine — is not an interceptor at all; it is the `network` closure
//! passed to [`execute`], matching spec.md §6's "the final link bypasses
//! the interceptor recursion".

use std::sync::Arc;

use crate::{
    call::CallState,
    cache::{CacheRequest, CacheStrategy, CachedResponse, NetworkRequest},
    error::{Error, Result},
};

/// One observer of the network exchange.
///
/// Implementations read `chain.request()`, optionally transform it, and
/// call [`Chain::proceed`] (or [`Chain::proceed_unchanged`]) to continue
/// down the chain. Returning without calling either is a contract
/// violation (mirrors spec.md §6: "returning null from intercept is a
/// contract violation") — `execute` has nothing to return in that case,
/// so implementors must always drive the chain forward or fail it.
pub trait Interceptor<B>: std::fmt::Debug + Send + Sync {
    fn intercept(&self, chain: &mut Chain<'_, B>) -> Result<http::Response<B>>;
}

/// The remaining interceptors and the in-flight request, with an
/// explicit position index standing in for the source's recursive
/// sub-chain allocation.
pub struct Chain<'a, B> {
    interceptors: &'a [Arc<dyn Interceptor<B>>],
    position: usize,
    request: Option<http::Request<()>>,
    network: &'a mut dyn FnMut(http::Request<()>) -> Result<http::Response<B>>,
}

impl<B> std::fmt::Debug for Chain<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("remaining_interceptors", &(self.interceptors.len() - self.position))
            .field("request", &self.request)
            .finish()
    }
}

impl<'a, B> Chain<'a, B> {
    /// The request as it stands at this point in the chain.
    ///
    /// # Panics
    ///
    /// Panics if called after [`proceed`](Chain::proceed) has already
    /// taken ownership of the request via
    /// [`take_request`](Chain::take_request) without a matching call —
    /// this indicates an interceptor calling `request()` twice across a
    /// `proceed`, which is a programmer error.
    pub fn request(&self) -> &http::Request<()> {
        self.request
            .as_ref()
            .expect("Chain::request called after the request was taken")
    }

    /// Takes ownership of the in-flight request, for interceptors that
    /// need to mutate it (e.g. add a header) before proceeding.
    pub fn take_request(&mut self) -> http::Request<()> {
        self.request
            .take()
            .expect("Chain::take_request called twice without an intervening proceed")
    }

    /// Advances the chain with `request`: the next interceptor if any
    /// remain, otherwise the final network link.
    pub fn proceed(&mut self, request: http::Request<()>) -> Result<http::Response<B>> {
        self.dispatch(request)
    }

    /// Advances the chain with the request unchanged from what
    /// [`request`](Chain::request) currently returns.
    pub fn proceed_unchanged(&mut self) -> Result<http::Response<B>> {
        let request = self.take_request();
        self.dispatch(request)
    }

    fn dispatch(&mut self, request: http::Request<()>) -> Result<http::Response<B>> {
        match self.interceptors.get(self.position) {
            Some(next) => {
                self.position += 1;
                self.request = Some(request);
                next.intercept(self)
            }
            None => (self.network)(request),
        }
    }
}

/// Runs `request` through `interceptors` in order, invoking `network`
/// once every interceptor has had a chance to observe or transform the
/// exchange.
pub fn execute<B>(
    interceptors: &[Arc<dyn Interceptor<B>>],
    request: http::Request<()>,
    network: &mut dyn FnMut(http::Request<()>) -> Result<http::Response<B>>,
) -> Result<http::Response<B>> {
    let mut chain = Chain {
        interceptors,
        position: 0,
        request: None,
        network,
    };
    chain.dispatch(request)
}

/// The first interceptor any chain built by this crate should install:
/// fails the call immediately if its [`CallState`] was cancelled before
/// the worker got around to running it (spec.md §5: "the worker is
/// responsible for observing cancellation before the callback fires").
#[derive(Debug)]
pub struct CancellationInterceptor {
    state: Arc<CallState>,
}

impl CancellationInterceptor {
    pub fn new(state: Arc<CallState>) -> Self {
        CancellationInterceptor { state }
    }
}

impl<B: 'static> Interceptor<B> for CancellationInterceptor {
    fn intercept(&self, chain: &mut Chain<'_, B>) -> Result<http::Response<B>> {
        if self.state.is_cancelled() {
            trace!("call cancelled before dispatch, failing without proceeding");
            return Err(Error::cancelled());
        }
        chain.proceed_unchanged()
    }
}

/// The external collaborator that stores cached response metadata and
/// bodies (spec.md §1's "on-disk response body storage ... is not [in
/// scope]"). [`CacheInterceptor`] only ever reads it.
pub trait CacheStore<B>: std::fmt::Debug + Send + Sync {
    /// Returns the cached response's metadata (for [`CacheStrategy`])
    /// paired with its stored body, if this store has an entry for
    /// `request`.
    fn load(&self, request: &http::Request<()>) -> Option<(CachedResponse, B)>;
}

/// Consults [`CacheStrategy`] before proceeding: serves a fresh cached
/// response without touching the network, adds a conditional header and
/// serves the cached body if the network link answers `304 Not
/// Modified`, or proceeds unconditionally when the cache has nothing
/// usable.
#[derive(Debug)]
pub struct CacheInterceptor<S> {
    store: S,
}

impl<S> CacheInterceptor<S> {
    pub fn new(store: S) -> Self {
        CacheInterceptor { store }
    }
}

impl<B, S> Interceptor<B> for CacheInterceptor<S>
where
    S: CacheStore<B>,
    B: 'static,
{
    fn intercept(&self, chain: &mut Chain<'_, B>) -> Result<http::Response<B>> {
        let uri = chain.request().uri().clone();
        let headers = chain.request().headers().clone();
        let loaded = self.store.load(chain.request());
        let cached_meta = loaded.as_ref().map(|(meta, _)| meta.clone());

        let decision =
            CacheStrategy::compute(now_millis(), CacheRequest::new(&uri, &headers), cached_meta);

        if decision.is_unsatisfiable() {
            return Err(Error::protocol(
                "only-if-cached request had no usable cached response",
            ));
        }

        match decision.network_request {
            None => {
                let (meta, body) = loaded.expect("cache_response implies a stored entry");
                trace!("serving response from cache without a network round trip");
                response_from_cached(meta, body)
            }
            Some(NetworkRequest::Unconditional) => chain.proceed_unchanged(),
            Some(NetworkRequest::Conditional(header)) => {
                let mut request = chain.take_request();
                if let Some(header) = header {
                    request.headers_mut().insert(header.name, header.value);
                }
                let response = chain.proceed(request)?;
                if response.status() == http::StatusCode::NOT_MODIFIED {
                    if let Some((meta, body)) = loaded {
                        trace!("304 Not Modified, serving the revalidated cached response");
                        return response_from_cached(meta, body);
                    }
                }
                Ok(response)
            }
        }
    }
}

fn response_from_cached<B>(meta: CachedResponse, body: B) -> Result<http::Response<B>> {
    let mut builder = http::Response::builder().status(meta.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = meta.headers;
    }
    builder
        .body(body)
        .map_err(|e| Error::assertion(format!("invalid cached response: {e}")))
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::call::{CallState, Tag};

    #[derive(Debug)]
    struct RecordingInterceptor {
        calls: Arc<AtomicUsize>,
    }

    impl Interceptor<()> for RecordingInterceptor {
        fn intercept(&self, chain: &mut Chain<'_, ()>) -> Result<http::Response<()>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            chain.proceed_unchanged()
        }
    }

    fn request() -> http::Request<()> {
        http::Request::builder()
            .uri("https://example.com/")
            .body(())
            .unwrap()
    }

    #[test]
    fn chain_runs_interceptors_in_order_then_network() {
        let calls = Arc::new(AtomicUsize::new(0));
        let interceptors: Vec<Arc<dyn Interceptor<()>>> = vec![
            Arc::new(RecordingInterceptor {
                calls: Arc::clone(&calls),
            }),
            Arc::new(RecordingInterceptor {
                calls: Arc::clone(&calls),
            }),
        ];
        let mut network_calls = 0usize;
        let mut network = |_req: http::Request<()>| -> Result<http::Response<()>> {
            network_calls += 1;
            Ok(http::Response::new(()))
        };
        let response = execute(&interceptors, request(), &mut network).unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(network_calls, 1);
    }

    #[test]
    fn cancellation_interceptor_short_circuits() {
        let state = Arc::new(CallState::new("example.com", Tag::new("t")));
        state.cancel();
        let interceptors: Vec<Arc<dyn Interceptor<()>>> =
            vec![Arc::new(CancellationInterceptor::new(state))];
        let mut network = |_req: http::Request<()>| -> Result<http::Response<()>> {
            panic!("network should not be reached for a cancelled call")
        };
        let err = execute(&interceptors, request(), &mut network).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[derive(Debug, Default)]
    struct EmptyStore;

    impl CacheStore<()> for EmptyStore {
        fn load(&self, _request: &http::Request<()>) -> Option<(CachedResponse, ())> {
            None
        }
    }

    #[test]
    fn cache_interceptor_proceeds_to_network_with_no_cached_entry() {
        let interceptors: Vec<Arc<dyn Interceptor<()>>> =
            vec![Arc::new(CacheInterceptor::new(EmptyStore))];
        let mut network_calls = 0usize;
        let mut network = |_req: http::Request<()>| -> Result<http::Response<()>> {
            network_calls += 1;
            Ok(http::Response::new(()))
        };
        let response = execute(&interceptors, request(), &mut network).unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(network_calls, 1);
    }
}
