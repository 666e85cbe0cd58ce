#[cfg(unix)]
mod unix;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "linux")]
pub use linux::LinuxProbe as PlatformProbe;

#[cfg(target_os = "windows")]
pub use windows::WindowsProbe as PlatformProbe;

#[cfg(target_os = "macos")]
pub use macos::MacOSProbe as PlatformProbe;

#[cfg(any(target_os = "linux", target_os = "windows", target_os = "macos"))]
use subdevil_core::{diagnostics, DeviceError, ManagerConfig, Subdevil};

/// Install diagnostics and build a manager backed by this host's probe.
#[cfg(any(target_os = "linux", target_os = "windows", target_os = "macos"))]
pub fn connect(config: &ManagerConfig) -> Result<Subdevil, DeviceError> {
    config.validate()?;
    diagnostics::init(config)?;
    Ok(Subdevil::new(PlatformProbe::default(), config))
}
