//! Call session state and the admission waitlist

pub mod store;
pub mod waitlist;

pub use store::{CallPhase, CallSession, SessionEpoch, SessionSnapshot, SessionStore};
pub use waitlist::{PendingJoinRequest, Waitlist};
