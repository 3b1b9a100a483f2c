//! Device, interface and transfer core for USB hosts whose interfaces are
//! served by several driver stacks.
//!
//! Everything the core needs from the operating system goes through the
//! traits in [os]; [sim::SimOs] implements all of them in memory.
mod error;
mod define;
mod descriptor;
mod registry;
mod backend;
mod slots;
mod device;
mod transfer;
mod handle;
mod context;
mod topology;
mod aggregate;
mod hotplug;
mod platform;
mod utils;

pub mod os;
pub mod sim;
pub mod prelude;

pub use backend::{Backend, SubApi};
pub use context::{PollFd, UsbContext};
pub use define::*;
pub use descriptor::*;
pub use device::UsbDevice;
pub use error::{Error, OsError, Result};
pub use handle::DeviceHandle;
pub use hotplug::{DeviceChange, DeviceEvent};
pub use platform::{ContextBuilder, Platform, PlatformBuilder};
pub use registry::{parse_device_interface_path, sanitize_path, SessionId};
pub use slots::{parse_interface_ordinal, InterfaceSlot, InterfaceSlots};
pub use transfer::{CompletedTransfer, SubmitHandle, TransferCancelToken, TransferRequest, TransferStatus};
