//! Certificate status production and consumption
//!
//! `codec` signs and verifies the self-contained status tokens, `wire` maps
//! them onto the published PV value, and `manager` runs the client-side
//! subscription lifecycle.

pub mod codec;
pub mod manager;
pub mod wire;

pub use codec::{decode_and_verify, encode, CertStatusFactory, ParsedStatus};
pub use manager::{CertStatusManager, StatusCallback, STATUS_FETCH_TIMEOUT};
pub use wire::{to_wire, verify_wire_status, StatusWireValue};
