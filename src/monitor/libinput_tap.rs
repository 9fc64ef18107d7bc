//! Seat-wide key tap on a libinput udev context.

use super::keyboard::{forward_key, SeatTap};
use super::{MonitorError, StopFlag, POLL_INTERVAL};
use crate::keys::KeyFilter;
use crate::manager::ManagerEvent;
use crossbeam_channel::Sender;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use tracing::{debug, trace};

use input::event::device::DeviceEvent;
use input::event::keyboard::{KeyState, KeyboardEvent, KeyboardEventTrait};
use input::event::EventTrait;
use input::{DeviceCapability, Event, Libinput, LibinputInterface};

struct Interface;

impl LibinputInterface for Interface {
    fn open_restricted(&mut self, path: &Path, flags: i32) -> Result<OwnedFd, i32> {
        let path_cstr = match std::ffi::CString::new(path.as_os_str().as_encoded_bytes()) {
            Ok(c) => c,
            Err(_) => return Err(libc::EINVAL),
        };
        let fd = unsafe { libc::open(path_cstr.as_ptr(), flags | libc::O_CLOEXEC) };
        if fd < 0 {
            Err(unsafe { *libc::__errno_location() })
        } else {
            Ok(unsafe { OwnedFd::from_raw_fd(fd) })
        }
    }

    fn close_restricted(&mut self, fd: OwnedFd) {
        drop(fd);
    }
}

pub struct LibinputTap {
    ctx: Libinput,
}

impl LibinputTap {
    /// Assigns a udev context to `seat`. Fails if the seat cannot be
    /// assigned or none of its keyboards could be opened, which usually
    /// means missing permissions on the event nodes.
    pub fn open(seat: &str) -> Result<Self, MonitorError> {
        let mut ctx = Libinput::new_with_udev(Interface);
        ctx.udev_assign_seat(seat)
            .map_err(|()| MonitorError::SeatUnavailable(seat.to_string()))?;
        ctx.dispatch()
            .map_err(|e| MonitorError::ReadError(e.to_string()))?;

        let mut keyboards = 0;
        for event in &mut ctx {
            if let Event::Device(DeviceEvent::Added(added)) = event {
                let device = added.device();
                if device.has_capability(DeviceCapability::Keyboard) {
                    debug!("seat tap sees keyboard: {}", device.name());
                    keyboards += 1;
                }
            }
        }
        if keyboards == 0 {
            return Err(MonitorError::SeatUnavailable(seat.to_string()));
        }

        Ok(Self { ctx })
    }
}

impl SeatTap for LibinputTap {
    fn run(
        &mut self,
        filter: &mut KeyFilter,
        events: &Sender<ManagerEvent>,
        stop: &StopFlag,
    ) -> Result<(), MonitorError> {
        let mut pollfd = libc::pollfd {
            fd: self.ctx.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = POLL_INTERVAL.as_millis() as i32;

        while !stop.is_set() {
            let ret = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(MonitorError::ReadError(err.to_string()));
            }
            if ret == 0 {
                continue;
            }

            self.ctx
                .dispatch()
                .map_err(|e| MonitorError::ReadError(e.to_string()))?;

            for event in &mut self.ctx {
                match event {
                    Event::Keyboard(KeyboardEvent::Key(key)) => {
                        let Ok(code) = u16::try_from(key.key()) else {
                            continue;
                        };
                        let pressed = key.key_state() == KeyState::Pressed;
                        if !forward_key(filter, events, code, pressed) {
                            return Ok(()); // manager gone
                        }
                    }
                    Event::Device(DeviceEvent::Added(added)) => {
                        trace!("seat tap: device added: {}", added.device().name())
                    }
                    Event::Device(DeviceEvent::Removed(removed)) => {
                        trace!("seat tap: device removed: {}", removed.device().name())
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}
