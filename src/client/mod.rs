//! The client layer (SPEC_FULL.md §4.6, §4.9, §4.10): presence/signaling
//! state machine, trust-gated handshake, and the chat/dm/question/ping
//! message plane, composed into one [`auth::AuthenticatedPeerClient`].

pub mod auth;
pub mod base;
pub mod event;
pub mod message_plane;

pub use auth::AuthenticatedPeerClient;
pub use base::BaseClient;
pub use event::{CallDirection, CallMetrics, Event};
pub use message_plane::{sync_handler, MessagePlane, PeerSender, QuestionFuture, QuestionHandler};
