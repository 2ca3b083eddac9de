//! # Peer connection
//!
//! Everything about one `RTCPeerConnection` lives here: the backend seam
//! ([`backend`]), the browser implementation ([`websys`], wasm32 only), the
//! in-memory test double ([`mock`]), and the aggregate session object used
//! by the client layer ([`session`]).

mod backend;
mod mock;
mod session;
#[cfg(target_arch = "wasm32")]
mod websys;

pub use backend::{ConnectionState, DataChannelState, RtcBackend, RtcConnection, RtcDataChannel};
pub use mock::{MockDataChannel, MockPeerConnection, MockRtcBackend};
pub use session::PeerSession;
#[cfg(target_arch = "wasm32")]
pub use websys::WebSysRtcBackend;
