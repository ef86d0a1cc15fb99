//! Plumbing for sharing one CAN transport among all services
//!
//! Each service holds a cheap clone of [`SharedSender`] for its outbound
//! frames and one [`SharedReceiverChannel`] for its inbound subscription.
//! Services never own the transport; dropping a channel simply unsubscribes
//! it.
mod shared_receiver;
mod shared_sender;

pub use shared_receiver::{RecvError, SharedReceiver, SharedReceiverChannel};
pub use shared_sender::SharedSender;
