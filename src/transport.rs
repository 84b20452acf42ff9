//! The transport engine collaborator (spec.md §6) and the "final link"
//! that invokes it.
//!
//! Byte-level HTTP/1.1 or HTTP/2 framing and TLS handshakes are out of
//! this crate's scope (`SPEC_FULL.md` §12); [`Engine`] is the contract an
//! embedder implements to supply them. [`NetworkInterceptor`] is the glue
//! that ties an [`Engine`] to a [`ConnectionPool`] the way spec.md §2's
//! data flow describes: acquire a connection, run the exchange (with
//! recovery and follow-ups), release the connection.

use std::{fmt, pin::Pin};

use futures_core::Stream;

use crate::{
    error::{Error, Result},
    pool::{ConnectionPool, Route, StreamAllocation, Transport},
};

/// A response body as a lazy stream of byte chunks — spec.md §6's
/// "`read_response()`: ... returns a lazy body stream" made concrete.
///
/// [`Engine::Body`] is left generic so embedders aren't forced into this
/// representation, but this is the recommended choice for anything that
/// actually streams bytes off a socket rather than buffering eagerly.
pub type ResponseBodyStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes>> + Send>>;

/// One in-flight HTTP exchange's connection to the transport layer.
///
/// This crate calls these methods in the order spec.md §6 describes:
/// `send_request`, then `read_response`; on failure, `recover` and retry
/// with the replacement engine; on success, `follow_up_request` to learn
/// whether a redirect or auth challenge requires another round trip.
pub trait Engine: fmt::Debug + Send {
    /// The response body type this engine produces. Left abstract: body
    /// framing and buffering are out of this crate's scope.
    type Body;

    /// Writes the request and opens a stream allocation against a pooled
    /// connection. Blocking.
    fn send_request(&mut self, request: &http::Request<()>) -> Result<()>;

    /// Reads response headers and returns a lazy body. Blocking.
    fn read_response(&mut self) -> Result<http::Response<Self::Body>>;

    /// Best-effort termination of in-flight I/O, invoked when a call is
    /// cancelled while this engine is mid-exchange.
    fn cancel(&mut self);

    /// Inspects a failure and returns a new engine to retry the exchange
    /// with, or `None` if the failure is unrecoverable.
    ///
    /// Reporting route failures to the pool's route database is the
    /// caller's responsibility (`SPEC_FULL.md` §11.5); `recover` only
    /// decides whether retrying is worthwhile.
    fn recover(&mut self, error: &Error) -> Option<Box<dyn Engine<Body = Self::Body>>>;

    /// Returns the next request for a redirect or auth challenge, or
    /// `None` once `response` is the final answer.
    fn follow_up_request(
        &self,
        response: &http::Response<Self::Body>,
    ) -> Option<http::Request<()>>;
}

/// The default follow-up cap (spec.md §6's canonical value), used when a
/// caller does not override it via
/// [`ChainConfig`](crate::config::ChainConfig).
pub const MAX_FOLLOW_UPS: u32 = 20;

/// Produces transports and engines on demand.
///
/// Mirrors the split between [`Transport`] (what the pool keeps alive)
/// and [`Engine`] (what drives one exchange): a single multiplexed
/// transport may back many engines over its lifetime.
pub trait Connector<T: Transport, R: Route>: fmt::Debug + Send + Sync {
    /// The engine type this connector produces.
    type Engine: Engine + 'static;

    /// Derives the route (address, proxy, socket family) for `request`.
    fn route_for(&self, request: &http::Request<()>) -> R;

    /// Opens a brand-new transport connection to `route`.
    fn connect(&self, route: &R) -> Result<T>;

    /// Builds an engine that will drive one exchange over `allocation`.
    fn engine_for(&self, allocation: &StreamAllocation<T, R>) -> Self::Engine;
}

/// The final link in an interceptor chain: acquires a pooled connection,
/// runs the exchange (recovering from retryable transport failures and
/// following redirects/auth challenges up to a configured limit), and
/// releases the connection allocation on every exit path.
///
/// Not an [`Interceptor`](crate::interceptor::Interceptor) itself —
/// spec.md §6 describes it as bypassing the interceptor recursion, so
/// callers wrap [`NetworkInterceptor::execute`] in the `network` closure
/// passed to [`interceptor::execute`](crate::interceptor::execute).
pub struct NetworkInterceptor<T: Transport, R: Route, C> {
    pool: ConnectionPool<T, R>,
    connector: C,
    max_multiplexed_streams: usize,
    follow_up_limit: u32,
}

impl<T, R, C> NetworkInterceptor<T, R, C>
where
    T: Transport,
    R: Route,
    C: Connector<T, R>,
{
    /// Creates a network link over `pool`, using `connector` to open new
    /// connections and build engines. `follow_up_limit` is typically
    /// [`ChainConfig::follow_up_limit`](crate::config::ChainConfig).
    pub fn new(
        pool: ConnectionPool<T, R>,
        connector: C,
        max_multiplexed_streams: usize,
        follow_up_limit: u32,
    ) -> Self {
        NetworkInterceptor {
            pool,
            connector,
            max_multiplexed_streams,
            follow_up_limit,
        }
    }

    /// Acquires a reusable connection for `request`'s route, opening a
    /// new one through the connector if the pool has none to reuse.
    fn allocate(&self, request: &http::Request<()>) -> Result<StreamAllocation<T, R>> {
        let route = self.connector.route_for(request);
        if let Some(allocation) = self.pool.get(&route) {
            return Ok(allocation);
        }

        let transport = self.connector.connect(&route)?;
        let connection = std::sync::Arc::new(crate::pool::RealConnection::new(
            route.clone(),
            transport,
            self.max_multiplexed_streams,
        ));
        self.pool.put(std::sync::Arc::clone(&connection));

        self.pool
            .get(&route)
            .ok_or_else(|| Error::assertion("connection unavailable immediately after put"))
    }

    /// Runs one send/read attempt, recovering from retryable transport
    /// failures by asking the engine for a replacement and looping.
    fn run_exchange<B>(
        &self,
        mut engine: Box<dyn Engine<Body = B>>,
        request: &http::Request<()>,
        route: &R,
    ) -> Result<(http::Response<B>, Option<http::Request<()>>)> {
        loop {
            let outcome = engine.send_request(request).and_then(|_| engine.read_response());
            match outcome {
                Ok(response) => {
                    self.pool.record_route_success(route);
                    let next = engine.follow_up_request(&response);
                    return Ok((response, next));
                }
                Err(err) => {
                    if err.is_transport() {
                        self.pool.record_route_failure(route.clone());
                    }
                    match engine.recover(&err) {
                        Some(replacement) => {
                            debug!(?route, "recovered from transport error, retrying");
                            engine = replacement;
                        }
                        None => return Err(err),
                    }
                }
            }
        }
    }

    /// Runs one call to completion: acquire a connection, exchange,
    /// follow redirects/auth up to the configured limit, and release the
    /// allocation on every exit path (the `allocation` local's `Drop`
    /// returns it to the pool whether this function returns `Ok` or
    /// propagates an error via `?`).
    pub fn execute<B>(&self, mut request: http::Request<()>) -> Result<http::Response<B>>
    where
        C::Engine: Engine<Body = B>,
        B: 'static,
    {
        let mut follow_ups = 0u32;
        loop {
            let allocation = self.allocate(&request)?;
            let route = allocation.connection().route().clone();
            let engine: Box<dyn Engine<Body = B>> =
                Box::new(self.connector.engine_for(&allocation));

            let (response, next) = self.run_exchange(engine, &request, &route)?;
            drop(allocation);

            match next {
                Some(next_request) => {
                    follow_ups += 1;
                    if follow_ups > self.follow_up_limit {
                        return Err(Error::protocol(format!(
                            "exceeded maximum of {} follow-up requests",
                            self.follow_up_limit
                        )));
                    }
                    request = next_request;
                }
                None => return Ok(response),
            }
        }
    }
}

impl<T: Transport, R: Route, C: fmt::Debug> fmt::Debug for NetworkInterceptor<T, R, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkInterceptor")
            .field("connector", &self.connector)
            .field("follow_up_limit", &self.follow_up_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::rt::{TokioExecutor, TokioTimer};

    #[derive(Debug)]
    struct FakeTransport;

    impl Transport for FakeTransport {
        fn is_open(&self) -> bool {
            true
        }
    }

    #[derive(Debug)]
    struct FakeEngine {
        attempts: Arc<AtomicUsize>,
        fail_first: bool,
    }

    impl Engine for FakeEngine {
        type Body = ();

        fn send_request(&mut self, _request: &http::Request<()>) -> Result<()> {
            Ok(())
        }

        fn read_response(&mut self) -> Result<http::Response<()>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && attempt == 0 {
                return Err(Error::transport("connection reset"));
            }
            Ok(http::Response::new(()))
        }

        fn cancel(&mut self) {}

        fn recover(&mut self, _error: &Error) -> Option<Box<dyn Engine<Body = ()>>> {
            Some(Box::new(FakeEngine {
                attempts: Arc::clone(&self.attempts),
                fail_first: false,
            }))
        }

        fn follow_up_request(&self, _response: &http::Response<()>) -> Option<http::Request<()>> {
            None
        }
    }

    #[derive(Debug)]
    struct FakeConnector {
        attempts: Arc<AtomicUsize>,
        fail_first: bool,
    }

    impl Connector<FakeTransport, &'static str> for FakeConnector {
        type Engine = FakeEngine;

        fn route_for(&self, _request: &http::Request<()>) -> &'static str {
            "route-a"
        }

        fn connect(&self, _route: &&'static str) -> Result<FakeTransport> {
            Ok(FakeTransport)
        }

        fn engine_for(
            &self,
            _allocation: &StreamAllocation<FakeTransport, &'static str>,
        ) -> FakeEngine {
            FakeEngine {
                attempts: Arc::clone(&self.attempts),
                fail_first: self.fail_first,
            }
        }
    }

    fn pool() -> ConnectionPool<FakeTransport, &'static str> {
        ConnectionPool::new(crate::config::PoolConfig::default(), TokioExecutor, TokioTimer)
            .unwrap()
    }

    #[tokio::test]
    async fn executes_and_releases_the_allocation() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let p = pool();
        let net = NetworkInterceptor::new(
            p.clone(),
            FakeConnector {
                attempts: Arc::clone(&attempts),
                fail_first: false,
            },
            1,
            20,
        );

        let request = http::Request::builder()
            .uri("https://example.com/")
            .body(())
            .unwrap();
        let response: http::Response<()> = net.execute(request).unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(p.idle_connection_count(), 1);
    }

    #[tokio::test]
    async fn recovers_from_a_retryable_transport_error() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let p = pool();
        let net = NetworkInterceptor::new(
            p,
            FakeConnector {
                attempts: Arc::clone(&attempts),
                fail_first: true,
            },
            1,
            20,
        );

        let request = http::Request::builder()
            .uri("https://example.com/")
            .body(())
            .unwrap();
        let response: http::Response<()> = net.execute(request).unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
