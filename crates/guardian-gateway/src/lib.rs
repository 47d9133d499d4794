pub mod channel;

pub use channel::PresenceChannel;
