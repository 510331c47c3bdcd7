//! # Meridian Core
//!
//! Core types shared by every Meridian crate:
//!
//! - [`Context`] - Per-request state: request, response writer, params, handler chain
//! - [`Handler`] and [`Chain`] - Middleware and route handlers
//! - [`ResponseWriter`] - Streaming response abstraction implemented by transports
//! - [`Request`] and [`Body`] - The request view and its lazily read body
//! - [`MeridianError`] - Error taxonomy rendered as JSON envelopes
//! - [`IpNet`] - CIDR networks for address based rules
//! - [`ResponseRecorder`] - In-memory writer for tests

#![doc(html_root_url = "https://docs.rs/meridian-core/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod body;
mod context;
mod error;
mod handler;
pub mod io;
mod net;
mod recorder;
mod request;
mod writer;

pub use body::{Body, BodyReader};
pub use context::{Context, RequestId, MAX_REQUEST_ID_LEN};
pub use error::{ErrorCategory, ErrorDetail, ErrorEnvelope, MeridianError, MeridianResult};
pub use handler::{handler_fn, named_fn, BoxFuture, Chain, FnHandler, Handler};
pub use io::{HijackError, Hijacked};
pub use net::{IpNet, NetParseError};
pub use recorder::{Recording, ResponseRecorder};
pub use request::{Request, TlsInfo};
pub use writer::{write_all, Detached, PushError, ResponseWriter};

pub use meridian_router::Params;
