/// Control plane: message serialization, the bounded outgoing queue, the
/// writer task, and the device-message receiver.
pub mod device_msg;
pub mod msg;
pub mod queue;
pub mod writer;

pub use device_msg::{DeviceMessage, DeviceMessageCallbacks, DeviceMessageReceiver};
pub use msg::{ControlMessage, ControlMessageType, CopyKey};
pub use queue::ControlQueue;
pub use writer::ControlWriter;
