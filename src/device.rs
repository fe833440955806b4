use std::fmt;
use std::str::FromStr;

use crate::timer::{Timer, WallClockTimer};
use crate::{Error, Result};

/// Where a model's work is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    Metal,
}

impl Device {
    /// The accelerator when one is present, the host otherwise.
    pub fn preferred() -> Device {
        if Device::Metal.check_available().is_ok() {
            Device::Metal
        } else {
            Device::Cpu
        }
    }

    pub fn check_available(&self) -> Result<()> {
        match self {
            Device::Cpu => Ok(()),
            Device::Metal => metal_available(),
        }
    }

    /// Builds the timing strategy matching this device.
    pub fn timer(&self) -> Result<Box<dyn Timer>> {
        match self {
            Device::Cpu => Ok(Box::new(WallClockTimer::new())),
            Device::Metal => metal_timer(),
        }
    }
}

#[cfg(target_os = "macos")]
fn metal_available() -> Result<()> {
    match metal::Device::system_default() {
        Some(_) => Ok(()),
        None => Err(Error::DeviceUnavailable {
            device: Device::Metal,
            reason: "no system default Metal device".to_string(),
        }),
    }
}

#[cfg(not(target_os = "macos"))]
fn metal_available() -> Result<()> {
    Err(metal_unsupported())
}

#[cfg(not(target_os = "macos"))]
fn metal_unsupported() -> Error {
    Error::DeviceUnavailable {
        device: Device::Metal,
        reason: "Metal is only supported on macOS".to_string(),
    }
}

#[cfg(target_os = "macos")]
fn metal_timer() -> Result<Box<dyn Timer>> {
    let runtime = crate::timer::MetalRuntime::new()?;
    Ok(Box::new(crate::timer::DeviceTimer::new(runtime)))
}

#[cfg(not(target_os = "macos"))]
fn metal_timer() -> Result<Box<dyn Timer>> {
    Err(metal_unsupported())
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Metal => write!(f, "metal"),
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "metal" | "mps" | "gpu" => Ok(Device::Metal),
            other => Err(Error::Config(format!("unknown device '{other}'"))),
        }
    }
}
