//! # Govee Adapter
//!
//! HTTP client and capability encoding for the Govee OpenAPI.
//!
//! ## Endpoints
//!
//! - `GET  /user/devices`: device inventory
//! - `POST /device/state`: current capability values of one device
//! - `POST /device/control`: set one capability of one device
//!
//! Every request carries the `Govee-API-Key` header. The control endpoint
//! accepts a single capability per request, so multi-attribute commands
//! must be split before they reach [`GoveeClient`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod encoding;

pub use client::{ClientError, GoveeClient, GoveeClientConfig};
pub use encoding::EncodingError;
