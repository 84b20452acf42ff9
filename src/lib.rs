#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # reqcore
//!
//! The client-side concurrency and connection-reuse core of an HTTP/1.1 and
//! HTTP/2 user-agent library: admission and scheduling of asynchronous and
//! synchronous calls ([`dispatcher`]), reuse and eviction of live transport
//! connections ([`pool`]), and an RFC 7234 cache-decision engine
//! ([`cache`]).
//!
//! This crate does not perform any I/O itself. It schedules work and
//! reuses connections on behalf of a transport engine that the embedder
//! supplies through the [`transport::Engine`] trait, and it decides when a
//! cached response may be served without consulting the network through
//! [`cache::CacheStrategy`].
//!
//! ## Dispatcher
//!
//! [`dispatcher::Dispatcher`] bounds how many calls may be in flight at
//! once, globally and per destination host, and promotes queued calls to
//! running as capacity frees up.
//!
//! ## ConnectionPool
//!
//! [`pool::ConnectionPool`] keeps a small cache of recently used
//! connections so that subsequent calls to the same route can reuse an
//! established connection instead of paying handshake cost again. A
//! background sweeper evicts idle and unhealthy connections and detects
//! allocations that were never returned.
//!
//! ## CacheStrategy
//!
//! [`cache::CacheStrategy::compute`] is a pure function that, given the
//! current time, a request, and an optional cached response, decides
//! whether to serve the cached response as-is, send a conditional
//! revalidation request, or fall back to an unconditional network request.

#[macro_use]
mod trace;

#[macro_use]
mod macros;

mod sync;

pub mod error;
pub use self::error::{Error, Result};

pub mod rt;

pub mod config;

pub mod call;

pub mod dispatcher;

pub mod pool;

pub mod cache;

pub mod transport;

pub mod interceptor;

fn _assert_impls() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    assert_send::<dispatcher::Dispatcher>();
    assert_sync::<dispatcher::Dispatcher>();

    fn _assert_pool_impls<T: pool::Transport, R: pool::Route>() {
        assert_send::<pool::ConnectionPool<T, R>>();
        assert_sync::<pool::ConnectionPool<T, R>>();
    }

    assert_send::<Error>();
    assert_sync::<Error>();
}
