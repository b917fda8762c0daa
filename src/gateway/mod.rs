//! The HTTP side of Floodgate: routing, limiting and forwarding.

mod guard;
mod proxy;
mod router;
mod server;

pub use guard::{client_ip, GuardOutcome, LimitGuard, GLOBAL_KEY};
pub use proxy::Forwarder;
pub use router::{RouteMatch, Router, Upstream};
pub use server::{Gateway, GatewayState};
