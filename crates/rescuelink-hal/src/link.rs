//! `CommandLink` – the flight-controller command channel.
//!
//! Every call may fail or hang.  Implementations report failure plainly;
//! time bounds and retries are applied by the kernel's command dispatcher,
//! never by the link itself.

use async_trait::async_trait;
use rescuelink_types::{RescueError, Waypoint};

#[async_trait]
pub trait CommandLink: Send + Sync {
    /// Stable identifier, e.g. `"mavlink0"`.
    fn id(&self) -> &str;

    /// Connect to the flight controller.
    ///
    /// # Errors
    ///
    /// Returns [`RescueError::Startup`] when the link cannot be established.
    async fn open(&mut self) -> Result<(), RescueError>;

    /// Hold position.
    async fn loiter(&mut self) -> Result<(), RescueError>;

    /// Fly to `waypoint`.
    async fn send_waypoint(&mut self, waypoint: &Waypoint) -> Result<(), RescueError>;

    /// Return to the launch point.
    async fn return_home(&mut self) -> Result<(), RescueError>;

    /// Stop all motion immediately.
    async fn stop(&mut self) -> Result<(), RescueError>;

    /// Disconnect.  Called exactly once, during shutdown.
    async fn release(&mut self);
}
