//! Cluster Module
//!
//! Membership snapshots and the remoting client used to reach peers.

mod membership;
mod remoting;

pub use membership::{Membership, Role};
pub use remoting::RemotingClient;
