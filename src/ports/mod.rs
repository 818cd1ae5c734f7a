pub mod clock;
pub mod control_plane;
pub mod dns;
#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use control_plane::{AppPatch, ConfigFetch, ControlPlane, ControlPlaneError};
pub use dns::{DnsError, Resolve};
