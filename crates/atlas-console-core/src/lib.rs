//! Core types for the Atlas console runtime.
//!
//! This crate provides the identifiers shared by the session and operation
//! tables:
//!
//! - [`SessionToken`]: opaque cookie value naming one live database session
//! - [`OperationId`]: handle a client polls for a queued control-plane mutation
//!
//! # Example
//!
//! ```
//! use atlas_console_core::{OperationId, SessionToken};
//!
//! let token = SessionToken::generate();
//! let parsed = SessionToken::from_hex(&token.to_hex()).unwrap();
//! assert_eq!(token, parsed);
//!
//! let op: OperationId = "67e55044-10b1-426f-9247-bb680e5fe0c8".parse().unwrap();
//! assert_eq!(op.to_string(), "67e55044-10b1-426f-9247-bb680e5fe0c8");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod ids;

pub use ids::{IdError, OperationId, SessionToken};
