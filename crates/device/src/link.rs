//! Network link supervision. The session only needs one bit: is the
//! underlying link usable right now? On Linux devices that is the
//! interface operstate; where no interface is configured the link is
//! assumed up and transport errors carry the load.

use std::path::PathBuf;

pub trait LinkStatus {
    fn is_up(&self) -> bool;
}

impl<L: LinkStatus + ?Sized> LinkStatus for Box<L> {
    fn is_up(&self) -> bool {
        (**self).is_up()
    }
}

/// Link assumed permanently up.
pub struct AlwaysUp;

impl LinkStatus for AlwaysUp {
    fn is_up(&self) -> bool {
        true
    }
}

/// Reads `/sys/class/net/<iface>/operstate`. A missing interface or an
/// explicit "down" counts as down; "unknown" (common for wireless drivers)
/// counts as up.
pub struct SysfsLink {
    operstate: PathBuf,
}

impl SysfsLink {
    pub fn new(iface: &str) -> Self {
        Self {
            operstate: PathBuf::from(format!("/sys/class/net/{iface}/operstate")),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_path(path: PathBuf) -> Self {
        Self { operstate: path }
    }
}

impl LinkStatus for SysfsLink {
    fn is_up(&self) -> bool {
        match std::fs::read_to_string(&self.operstate) {
            Ok(state) => matches!(state.trim(), "up" | "unknown"),
            Err(_) => false,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
