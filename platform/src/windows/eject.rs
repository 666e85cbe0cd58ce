use std::path::Path;
use subdevil_core::{UnmountError, UnmountTarget};
use windows::core::HSTRING;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FlushFileBuffers, FILE_FLAGS_AND_ATTRIBUTES, FILE_SHARE_READ, FILE_SHARE_WRITE,
    OPEN_EXISTING,
};
use windows::Win32::System::Ioctl::{
    FSCTL_DISMOUNT_VOLUME, FSCTL_LOCK_VOLUME, IOCTL_STORAGE_EJECT_MEDIA,
};
use windows::Win32::System::IO::DeviceIoControl;

const GENERIC_READ: u32 = 0x8000_0000;
const GENERIC_WRITE: u32 = 0x4000_0000;

const ERROR_ACCESS_DENIED: u32 = 5;
const ERROR_SHARING_VIOLATION: u32 = 32;
const ERROR_LOCK_VIOLATION: u32 = 33;
const ERROR_NOT_READY: u32 = 21;
const ERROR_CRC: u32 = 23;
const ERROR_IO_DEVICE: u32 = 1117;

/// Win32 error code carried inside an HRESULT.
fn win32_code(err: &windows::core::Error) -> u32 {
    (err.code().0 as u32) & 0xFFFF
}

pub(crate) fn classify(code: u32, context: &str) -> UnmountError {
    let message = format!("{} (os error {})", context, code);
    match code {
        ERROR_ACCESS_DENIED => UnmountError::PermissionDenied(message),
        ERROR_SHARING_VIOLATION | ERROR_LOCK_VIOLATION => UnmountError::Busy(message),
        ERROR_NOT_READY | ERROR_CRC | ERROR_IO_DEVICE => UnmountError::IoFailure(message),
        _ => UnmountError::Unknown(message),
    }
}

/// Volume handle closed on drop.
struct Volume(HANDLE);

impl Volume {
    fn open(path: &str) -> windows::core::Result<Self> {
        let handle = unsafe {
            CreateFileW(
                &HSTRING::from(path),
                GENERIC_READ | GENERIC_WRITE,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                None,
                OPEN_EXISTING,
                FILE_FLAGS_AND_ATTRIBUTES(0),
                HANDLE::default(),
            )?
        };
        Ok(Self(handle))
    }

    fn control(&self, code: u32) -> windows::core::Result<()> {
        let mut returned = 0u32;
        unsafe {
            DeviceIoControl(
                self.0,
                code,
                None,
                0,
                None,
                0,
                Some(&mut returned),
                None,
            )
        }
    }

    fn flush(&self) -> windows::core::Result<()> {
        unsafe { FlushFileBuffers(self.0) }
    }

    /// Open files make the lock fail with access denied, so any lock
    /// failure reads as busy.
    fn lock(&self, path: &str) -> Result<(), UnmountError> {
        self.control(FSCTL_LOCK_VOLUME).map_err(|e| {
            let code = win32_code(&e);
            match code {
                ERROR_ACCESS_DENIED | ERROR_SHARING_VIOLATION | ERROR_LOCK_VIOLATION => {
                    UnmountError::Busy(format!("{} is in use (os error {})", path, code))
                }
                _ => classify(code, &format!("lock {}", path)),
            }
        })
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

/// `E:\` becomes `\\.\E:`.
fn volume_for_mount(mount_point: &Path) -> String {
    let root = mount_point.to_string_lossy();
    format!("\\\\.\\{}", root.trim_end_matches('\\'))
}

fn volume_path(target: &UnmountTarget) -> String {
    target
        .volume_path
        .clone()
        .unwrap_or_else(|| volume_for_mount(&target.mount_point))
}

pub(crate) fn flush(mount_point: &Path) -> std::io::Result<()> {
    let path = volume_for_mount(mount_point);
    let os_error = |e: windows::core::Error| std::io::Error::from_raw_os_error(win32_code(&e) as i32);
    let volume = Volume::open(&path).map_err(os_error)?;
    volume.flush().map_err(os_error)
}

pub(crate) fn unmount(target: &UnmountTarget) -> Result<(), UnmountError> {
    let path = volume_path(target);
    let volume = Volume::open(&path).map_err(|e| classify(win32_code(&e), &format!("open {}", path)))?;

    volume
        .flush()
        .map_err(|e| classify(win32_code(&e), &format!("flush {}", path)))?;
    volume.lock(&path)?;
    volume
        .control(FSCTL_DISMOUNT_VOLUME)
        .map_err(|e| classify(win32_code(&e), &format!("dismount {}", path)))
}

pub(crate) fn release(target: &UnmountTarget) -> Result<(), UnmountError> {
    let path = volume_path(target);
    let volume = Volume::open(&path).map_err(|e| classify(win32_code(&e), &format!("open {}", path)))?;
    volume.lock(&path)?;
    volume
        .control(IOCTL_STORAGE_EJECT_MEDIA)
        .map_err(|e| classify(win32_code(&e), &format!("eject {}", path)))
}
