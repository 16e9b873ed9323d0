//! Duplexify
//!
//! Pull-based, backpressure-aware byte sockets on top of event-driven secret
//! streams.
//!
//! A [`PushStream`](push::PushStream) announces what happens to it through
//! events (data arrived, the write buffer drained, the peer ended, an error
//! occurred) and only moves data while it is resumed. A
//! [`DuplexAdapter`](adapter::DuplexAdapter) turns that into a tokio
//! `AsyncRead + AsyncWrite` stream: reads pull data with pause/resume flow
//! control, writes wait out backpressure, half-close waits for the push
//! stream to finish, and teardown happens exactly once whatever triggers it.
//!
//! [`SecretSocket`](socket::SecretSocket) adds the socket surface on top:
//! public keys, byte counters and transport controls forwarded to the raw
//! connection. The [`server`] and [`client`] modules accept and dial secret
//! sockets over TCP and can run HTTP/1 over them with hyper.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::future::Future;
use std::pin::Pin;

pub mod adapter;
pub mod bridge;
#[cfg(feature = "client")]
pub mod client;
pub mod error;
pub mod info;
mod notify;
pub mod push;
#[cfg(feature = "server")]
pub mod server;
pub mod socket;
pub mod stream;

pub use adapter::{AdapterOptions, DuplexAdapter};
pub use error::StreamError;
pub use notify::{CloseListener, Notified};
pub use socket::SecretSocket;

#[cfg(feature = "client")]
pub use client::Client;
#[cfg(feature = "server")]
pub use server::Server;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
