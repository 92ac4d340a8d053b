//! Testing utilities for Trellis applications.
//!
//! - **TestClient** - dispatches requests in-process, no sockets
//! - **RecordingSink** - response sink that keeps what was written
//! - **MockService** - call recorder, usable as middleware
//! - **Assertions** - status, header and body checks
//!
//! ```
//! use trellis_core::{Application, ResponseExt, StringResponse};
//! use trellis_testing::*;
//!
//! # tokio_test::block_on(async {
//! let app = Application::builder()
//!     .no_default_controller()
//!     .get("/hello", |_ctx, _req| async { Ok(StringResponse::new("Hello!").boxed()) })
//!     .build()
//!     .unwrap();
//!
//! let client = TestClient::new(app);
//! let response = client.get("/hello").await;
//! assert_status(&response, 200);
//! assert_body(&response, "Hello!");
//! # });
//! ```

pub mod assertions;
pub mod mock;
pub mod sink;
pub mod test_client;

pub use assertions::*;
pub use mock::MockService;
pub use sink::{DisconnectHandle, RecordingSink};
pub use test_client::{TestClient, TestRequest, TestResponse};
