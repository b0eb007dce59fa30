//! Stratus core: the device-to-cloud request engine
//!
//! A single worker thread owns one CoAP-over-DTLS session and multiplexes
//! every application request over it: one-shot reads, writes, deletes,
//! block-wise downloads and long-lived observations. Requests flow
//! through a bounded FIFO queue, responses are correlated by token, and
//! the session heals itself: on any fatal error or response timeout the
//! engine reconnects and transparently re-establishes all observations.
//!
//! The CoAP/DTLS codec itself is a collaborator behind the
//! [`transport::CoapTransport`] trait; this crate never touches wire
//! bytes. [`transport::mock::MockTransport`] ships with the crate so the
//! engine can be driven without a network.
//!
//! ```no_run
//! use stratus_core::{Client, ClientConfig, Credentials};
//! use stratus_core::transport::{content_format, mock::MockTransport};
//!
//! # async fn demo() -> stratus_core::Result<()> {
//! let config = ClientConfig::new(
//!     "coaps://coap.example.io",
//!     Credentials::Psk {
//!         identity: "device-1@project".into(),
//!         key: b"secret".to_vec(),
//!     },
//! );
//! let client = Client::create(config, Box::new(MockTransport::new()))?;
//! client.post(".d/", "hello", content_format::JSON, b"\"world\"", None).await?;
//! let value = client.get(".d/", "hello", content_format::JSON, None).await?;
//! # drop(value);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod completion;
pub mod config;
pub mod error;
pub mod observe;
pub mod queue;
pub mod request;
mod session;
pub mod transport;

pub use client::{Client, ClientEvent, EventHandler};
pub use config::{ClientConfig, Credentials};
pub use error::{Error, Result, ServerResponse};
pub use request::{GetHandler, Request, RequestKind, SetHandler, Token};
