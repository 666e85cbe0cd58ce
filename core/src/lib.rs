pub mod config;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod manager;
pub mod normalize;
pub mod probe;
pub mod registry;
pub mod test_utils;
pub mod unmount;

pub use config::ManagerConfig;
pub use device::{BusType, DeviceRecord, DeviceState, RawDeviceInfo, UnmountTarget};
pub use error::{DeviceError, ErrorKind, UnmountError};
pub use manager::{DeviceManager, Subdevil};
pub use probe::{DeviceProbe, ScanSink, VolumeEjector};
pub use registry::{DeviceRegistry, PollReport};
pub use unmount::UnmountController;
