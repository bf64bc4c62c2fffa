pub mod callback;
pub mod client;
pub mod message;

pub use client::{GatewayPort, GewechatClient};
pub use message::{classify, EventKind, InboundEvent};
