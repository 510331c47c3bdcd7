//! Test helpers for Meridian applications.
//!
//! - [`TestClient`] runs requests through a [`Routes`](meridian_server::Routes)
//!   table in-process, against an in-memory response writer.
//! - [`TestServer`] serves the same table on an ephemeral port and hands out
//!   raw [`TestConnection`]s for framing-level assertions.
//!
//! ```ignore
//! use meridian_test::TestClient;
//!
//! #[tokio::test]
//! async fn test_get_user() {
//!     let client = TestClient::new(app_routes());
//!     let response = client
//!         .get("/users/123")
//!         .header("Authorization", "Bearer token")
//!         .send()
//!         .await;
//!     response.assert_status(StatusCode::OK);
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/meridian-test/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod client;
mod error;
mod request;
mod response;
mod server;

pub use client::{TestClient, TestClientRequest};
pub use error::TestError;
pub use request::TestRequestBuilder;
pub use response::TestResponse;
pub use server::{TestConnection, TestServer, WireResponse};
