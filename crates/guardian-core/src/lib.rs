pub mod dispatcher;
pub mod interpreter;
pub mod registry;

pub use dispatcher::{CommandDispatcher, DispatchError};
pub use registry::DeviceRegistry;
