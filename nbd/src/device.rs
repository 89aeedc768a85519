//! Linux kernel NBD device support.
//!
//! Binds an already-connected socket to a device node such as `/dev/nbd0`
//! with ioctls, then parks a thread in `NBD_DO_IT` until the kernel lets go
//! of the device.
//!
//! # Example
//!
//! ```ignore
//! use nbd::NbdDevice;
//!
//! let (kernel_end, server_end) = std::os::unix::net::UnixStream::pair()?;
//! let mut device = NbdDevice::open("/dev/nbd0")?;
//! device.configure(kernel_end.into(), size_bytes, flags)?;
//!
//! let teardown = device.teardown();
//! // serve `server_end` elsewhere, call `teardown.run()` to force a release
//! std::thread::spawn(move || device.run());
//! ```

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use nix::libc;
use thiserror::Error;
use tracing::{debug, info, warn};

// NBD ioctl numbers from linux/nbd.h (architecture-independent)
mod ioctl {
    use nix::libc;
    pub const NBD_SET_SOCK: libc::c_ulong = 0xab00;
    pub const NBD_SET_SIZE: libc::c_ulong = 0xab02;
    pub const NBD_DO_IT: libc::c_ulong = 0xab03;
    pub const NBD_CLEAR_SOCK: libc::c_ulong = 0xab04;
    pub const NBD_CLEAR_QUE: libc::c_ulong = 0xab05;
    pub const NBD_DISCONNECT: libc::c_ulong = 0xab08;
    pub const NBD_SET_FLAGS: libc::c_ulong = 0xab0a;
}

/// A device-control operation on an NBD device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOp {
    SetSock,
    SetSize,
    DoIt,
    ClearSock,
    ClearQue,
    Disconnect,
    SetFlags,
}

impl DeviceOp {
    pub fn request(self) -> libc::c_ulong {
        match self {
            Self::SetSock => ioctl::NBD_SET_SOCK,
            Self::SetSize => ioctl::NBD_SET_SIZE,
            Self::DoIt => ioctl::NBD_DO_IT,
            Self::ClearSock => ioctl::NBD_CLEAR_SOCK,
            Self::ClearQue => ioctl::NBD_CLEAR_QUE,
            Self::Disconnect => ioctl::NBD_DISCONNECT,
            Self::SetFlags => ioctl::NBD_SET_FLAGS,
        }
    }
}

impl fmt::Display for DeviceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SetSock => "NBD_SET_SOCK",
            Self::SetSize => "NBD_SET_SIZE",
            Self::DoIt => "NBD_DO_IT",
            Self::ClearSock => "NBD_CLEAR_SOCK",
            Self::ClearQue => "NBD_CLEAR_QUE",
            Self::Disconnect => "NBD_DISCONNECT",
            Self::SetFlags => "NBD_SET_FLAGS",
        };
        f.write_str(name)
    }
}

/// Kernel device errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(
        "cannot open {}, make sure the nbd kernel module is loaded: {source}",
        .path.display()
    )]
    Open { path: PathBuf, source: io::Error },

    #[error("device {} is already bound elsewhere", .path.display())]
    Busy { path: PathBuf },

    #[error("failed to give the kernel its socket: {0}")]
    SetSocket(io::Error),

    #[error("{op} failed: {source}")]
    Ioctl { op: DeviceOp, source: io::Error },
}

/// Issues device-control calls against an NBD device node.
pub trait DeviceControl: Send + Sync + 'static {
    fn control(&self, op: DeviceOp, arg: libc::c_ulong) -> io::Result<()>;
}

impl DeviceControl for File {
    fn control(&self, op: DeviceOp, arg: libc::c_ulong) -> io::Result<()> {
        // SAFETY: the fd is owned by `self` and every NBD request takes either
        // no argument or a plain integer.
        let rc = unsafe { libc::ioctl(self.as_raw_fd(), op.request() as _, arg) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

/// One-shot device cleanup.
///
/// Shared between the thread blocked in `NBD_DO_IT` and whoever reacts to a
/// shutdown signal. The disconnect/clear sequence is issued at most once no
/// matter how many callers race; late callers block until it completes.
pub struct Teardown<C> {
    control: Arc<C>,
    once: Once,
    issued: AtomicBool,
}

impl<C: DeviceControl> Teardown<C> {
    fn new(control: Arc<C>) -> Self {
        Self {
            control,
            once: Once::new(),
            issued: AtomicBool::new(false),
        }
    }

    /// Disconnect the device and clear its queue and socket.
    ///
    /// Returns true for the one caller that actually issued the calls.
    pub fn run(&self) -> bool {
        let mut ran = false;
        self.once.call_once(|| {
            for op in [DeviceOp::Disconnect, DeviceOp::ClearQue, DeviceOp::ClearSock] {
                if let Err(e) = self.control.control(op, 0) {
                    debug!(%op, error = %e, "cleanup ioctl failed");
                }
            }
            self.issued.store(true, Ordering::Release);
            ran = true;
            info!("device has been disconnected");
        });
        ran
    }

    /// Whether the cleanup sequence was issued.
    pub fn is_issued(&self) -> bool {
        self.issued.load(Ordering::Acquire)
    }

    // The binding belongs to someone else; make every later `run` a no-op.
    fn disarm(&self) {
        self.once.call_once(|| {});
    }
}

/// An NBD device node bound to a socket.
///
/// Dropping the device runs the teardown if the socket was bound.
pub struct NbdDevice<C: DeviceControl = File> {
    path: PathBuf,
    control: Arc<C>,
    teardown: Arc<Teardown<C>>,
    /// Our end of the kernel's socket, held until the device is released.
    socket: Option<OwnedFd>,
}

impl NbdDevice<File> {
    /// Open a device node for read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| DeviceError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::with_control(path, file))
    }
}

impl<C: DeviceControl> NbdDevice<C> {
    /// Wrap an already-open device handle.
    pub fn with_control(path: impl Into<PathBuf>, control: C) -> Self {
        let control = Arc::new(control);
        Self {
            path: path.into(),
            teardown: Arc::new(Teardown::new(Arc::clone(&control))),
            control,
            socket: None,
        }
    }

    /// Handle for triggering the one-shot cleanup from another thread.
    pub fn teardown(&self) -> Arc<Teardown<C>> {
        Arc::clone(&self.teardown)
    }

    /// Bind `socket` to the device and declare its size and flags.
    ///
    /// Clearing stale state and setting size/flags are best-effort; only the
    /// socket bind is load-bearing.
    pub fn configure(
        &mut self,
        socket: OwnedFd,
        size_bytes: u64,
        flags: u32,
    ) -> Result<(), DeviceError> {
        debug!(device = %self.path.display(), "clearing prior socket in case of a prior crash");
        self.best_effort(DeviceOp::ClearQue, 0);
        self.best_effort(DeviceOp::ClearSock, 0);

        info!(
            device = %self.path.display(),
            size_mib = size_bytes / 1024 / 1024,
            "setting disk size"
        );
        self.best_effort(DeviceOp::SetSize, size_bytes as libc::c_ulong);

        if let Err(e) = self
            .control
            .control(DeviceOp::SetSock, socket.as_raw_fd() as libc::c_ulong)
        {
            if e.raw_os_error() == Some(libc::EBUSY) {
                self.teardown.disarm();
                return Err(DeviceError::Busy {
                    path: self.path.clone(),
                });
            }
            return Err(DeviceError::SetSocket(e));
        }
        self.socket = Some(socket);

        self.best_effort(DeviceOp::SetFlags, flags as libc::c_ulong);
        Ok(())
    }

    /// Hand the device to the kernel. Blocks until the kernel releases it.
    ///
    /// The teardown runs before this returns, except when the device turned
    /// out to be busy.
    pub fn run(&self) -> Result<(), DeviceError> {
        info!(device = %self.path.display(), "signalling kernel to start handling block device");
        let result = match self.control.control(DeviceOp::DoIt, 0) {
            Ok(()) => Ok(()),
            // Expected once our own disconnect has gone through.
            Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                warn!(device = %self.path.display(), "is the nbd device mounted?");
                self.teardown.disarm();
                return Err(DeviceError::Busy {
                    path: self.path.clone(),
                });
            }
            Err(source) => Err(DeviceError::Ioctl {
                op: DeviceOp::DoIt,
                source,
            }),
        };

        match &result {
            Ok(()) => info!(device = %self.path.display(), "kernel has released the device"),
            Err(e) => warn!(device = %self.path.display(), error = %e, "device is done with error"),
        }
        self.teardown.run();
        result
    }

    fn best_effort(&self, op: DeviceOp, arg: libc::c_ulong) {
        if let Err(e) = self.control.control(op, arg) {
            debug!(%op, error = %e, "ignoring ioctl failure");
        }
    }
}

impl<C: DeviceControl> Drop for NbdDevice<C> {
    fn drop(&mut self) {
        if self.socket.is_some() {
            self.teardown.run();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::sync::Mutex;
    use std::thread;

    /// Records every call and fails the configured operations.
    #[derive(Default)]
    struct FakeControl {
        calls: Mutex<Vec<DeviceOp>>,
        failures: Vec<(DeviceOp, i32)>,
    }

    impl FakeControl {
        fn failing(failures: Vec<(DeviceOp, i32)>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failures,
            }
        }

        fn calls(&self) -> Vec<DeviceOp> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, op: DeviceOp) -> usize {
            self.calls().iter().filter(|&&c| c == op).count()
        }
    }

    impl DeviceControl for FakeControl {
        fn control(&self, op: DeviceOp, _arg: libc::c_ulong) -> io::Result<()> {
            self.calls.lock().unwrap().push(op);
            match self.failures.iter().find(|(f, _)| *f == op) {
                Some((_, errno)) => Err(io::Error::from_raw_os_error(*errno)),
                None => Ok(()),
            }
        }
    }

    fn socket() -> OwnedFd {
        let (kernel_end, _server_end) = UnixStream::pair().unwrap();
        kernel_end.into()
    }

    fn device(control: FakeControl) -> (NbdDevice<FakeControl>, Arc<FakeControl>) {
        let device = NbdDevice::with_control("/dev/nbd-test", control);
        let control = Arc::clone(&device.control);
        (device, control)
    }

    #[test]
    fn configure_issues_calls_in_order() {
        let (mut device, control) = device(FakeControl::default());
        device.configure(socket(), 1 << 20, 0).unwrap();

        assert_eq!(
            control.calls(),
            vec![
                DeviceOp::ClearQue,
                DeviceOp::ClearSock,
                DeviceOp::SetSize,
                DeviceOp::SetSock,
                DeviceOp::SetFlags,
            ]
        );
    }

    #[test]
    fn configure_ignores_failed_clears() {
        let (mut device, _control) = device(FakeControl::failing(vec![
            (DeviceOp::ClearQue, libc::EINVAL),
            (DeviceOp::ClearSock, libc::EINVAL),
        ]));
        device.configure(socket(), 4096, 0).unwrap();
    }

    #[test]
    fn configure_fails_when_socket_bind_fails() {
        let (mut device, control) = device(FakeControl::failing(vec![(
            DeviceOp::SetSock,
            libc::EINVAL,
        )]));
        let result = device.configure(socket(), 4096, 0);

        assert!(matches!(result, Err(DeviceError::SetSocket(_))));
        assert_eq!(control.count(DeviceOp::SetFlags), 0);
        drop(device);
        // Nothing was bound, so nothing to disconnect.
        assert_eq!(control.count(DeviceOp::Disconnect), 0);
    }

    #[test]
    fn busy_socket_bind_owes_no_cleanup() {
        let (mut device, control) =
            device(FakeControl::failing(vec![(DeviceOp::SetSock, libc::EBUSY)]));
        let teardown = device.teardown();

        let result = device.configure(socket(), 4096, 0);
        assert!(matches!(result, Err(DeviceError::Busy { .. })));

        assert!(!teardown.run());
        assert_eq!(control.count(DeviceOp::Disconnect), 0);
    }

    #[test]
    fn busy_do_it_owes_no_cleanup() {
        let (mut device, control) =
            device(FakeControl::failing(vec![(DeviceOp::DoIt, libc::EBUSY)]));
        device.configure(socket(), 4096, 0).unwrap();

        assert!(matches!(device.run(), Err(DeviceError::Busy { .. })));
        drop(device);
        assert_eq!(control.count(DeviceOp::Disconnect), 0);
    }

    #[test]
    fn run_tears_down_after_release() {
        let (mut device, control) = device(FakeControl::default());
        device.configure(socket(), 4096, 0).unwrap();
        device.run().unwrap();

        let calls = control.calls();
        assert_eq!(
            &calls[calls.len() - 4..],
            &[
                DeviceOp::DoIt,
                DeviceOp::Disconnect,
                DeviceOp::ClearQue,
                DeviceOp::ClearSock,
            ]
        );
        assert!(device.teardown().is_issued());
    }

    #[test]
    fn enotconn_from_do_it_is_a_clean_release() {
        let (mut device, _control) =
            device(FakeControl::failing(vec![(DeviceOp::DoIt, libc::ENOTCONN)]));
        device.configure(socket(), 4096, 0).unwrap();
        device.run().unwrap();
    }

    #[test]
    fn do_it_error_is_reported_and_still_torn_down() {
        let (mut device, control) =
            device(FakeControl::failing(vec![(DeviceOp::DoIt, libc::EIO)]));
        device.configure(socket(), 4096, 0).unwrap();

        assert!(matches!(
            device.run(),
            Err(DeviceError::Ioctl {
                op: DeviceOp::DoIt,
                ..
            })
        ));
        assert_eq!(control.count(DeviceOp::Disconnect), 1);
    }

    #[test]
    fn concurrent_teardown_runs_once() {
        let (mut device, control) = device(FakeControl::default());
        device.configure(socket(), 4096, 0).unwrap();
        let device = Arc::new(device);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let teardown = device.teardown();
            handles.push(thread::spawn(move || teardown.run()));
        }
        let runner = {
            let device = Arc::clone(&device);
            thread::spawn(move || device.run())
        };

        let ran: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        runner.join().unwrap().unwrap();
        drop(device);

        assert!(ran <= 1);
        assert_eq!(control.count(DeviceOp::Disconnect), 1);
        assert_eq!(control.count(DeviceOp::ClearQue), 2);
        assert_eq!(control.count(DeviceOp::ClearSock), 2);
    }
}
