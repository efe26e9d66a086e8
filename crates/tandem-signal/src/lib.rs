//! Tandem Signal Server
//!
//! Rendezvous server for two-party WebRTC sessions. Clients connect via
//! WebSocket, first to get paired and then to exchange session descriptions.
//!
//! # Protocol
//!
//! 1. Both endpoints send a matchmaking request on `/matchmaking`
//! 2. The server pairs them and sends each a `MATCH` with a shared room id
//! 3. Both endpoints `register` that room id on `/signaling`
//! 4. Offers, answers and candidates are relayed verbatim to the partner
//! 5. Signal connections can be dropped once the peer link is up

pub mod pairing;
pub mod relay;
pub mod room;
pub mod server;
pub mod transport;

pub use pairing::{Pairing, PairingQueue, Registration, WaitHandle};
pub use relay::{MessageRelay, RelayOutcome};
pub use room::{PeerId, RoomMembership, RoomRegistry, RoomState, Slot};
pub use server::{Endpoint, Route, SignalServer};
pub use transport::{PeerSink, SharedSink, WsSink};

pub use tandem_core::DEFAULT_PORT;
