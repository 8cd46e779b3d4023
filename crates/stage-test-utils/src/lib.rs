//! # Stage Test Utilities
//!
//! Mock implementations and fixtures for isolated testing of the Soundstage
//! call orchestration core, without a real signaling fabric, capture
//! devices, or media transports.
//!
//! ## Modules
//!
//! - `hub` - in-memory signaling hub (duplicate delivery, injected failures,
//!   abrupt disconnects)
//! - `mock_media` - device layer granting deterministic streams, or denying
//! - `mock_peer` - scripted peer transports, observable from the test
//! - `fixtures` - pre-wired orchestrators and request builders
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stage_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let stage = TestStage::spawn();
//!     stage.handle.initialize(join_request("s1", "u1")).await.unwrap();
//!
//!     // Drive peers, assert on stage.registry / stage.hub / stage.peers...
//!
//!     stage.handle.leave().await;
//!     assert!(stage.registry.is_empty());
//! }
//! ```

pub mod fixtures;
pub mod hub;
pub mod mock_media;
pub mod mock_peer;

// Re-export commonly used items
pub use fixtures::*;
pub use hub::*;
pub use mock_media::*;
pub use mock_peer::*;
