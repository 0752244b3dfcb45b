#![warn(missing_docs)]

//! seisrelay IACP stack: the generic framed transport (handshake,
//! heartbeat, alerts, latency-adaptive throttle) and the ISI payload
//! decoder built on it.

pub mod error;
pub mod frame;
pub mod isi;
pub mod throttle;
pub mod transport;

pub use error::{IacpError, IacpResult};
pub use frame::{AlertCode, HandshakeParams, IacpFrame, PayloadKind};
pub use isi::{DataDesc, IsiDecoder, IsiHandler, IsiRecord, SeqNo};
pub use throttle::{AdaptiveThrottle, ThrottleAction, ThrottleConfig};
pub use transport::{IacpConfig, IacpConnection, RunEnd};
