//! Glue between the tokio/tower world of this crate and `hyper`.
//!
//! Sockets produced by the listening and dialing bridges are tokio
//! `AsyncRead + AsyncWrite` streams; hyper's connection drivers want
//! `hyper::rt::{Read, Write}` and `hyper::service::Service`.

/// Bridge [hyper] and [tokio] I/O traits
pub mod io;

/// Service adaptor for translating between [tower] and [hyper]
pub mod service;
