use crate::control::ControlServer;
use crate::display::DisplayServer;
use crate::process::ChildRegistry;
use log::{debug, info, warn};
use nix::sys::signal::{Signal, kill};
use std::sync::{Arc, Mutex, PoisonError};

pub type DisplaySlot = Arc<Mutex<Option<DisplayServer>>>;

/// Tears the sandbox down: interrupt every child, stop the display server,
/// close the control channel. Running it more than once is harmless.
#[derive(Clone)]
pub struct Shutdown {
    registry: Arc<ChildRegistry>,
    display: DisplaySlot,
    control: Arc<ControlServer>,
}

impl Shutdown {
    pub fn new(
        registry: Arc<ChildRegistry>,
        display: DisplaySlot,
        control: Arc<ControlServer>,
    ) -> Self {
        Self {
            registry,
            display,
            control,
        }
    }

    pub fn run(&self) {
        info!("Shutting down sandbox");

        for child in self.registry.snapshot() {
            debug!("Sending SIGINT to {} ({})", child.pid, child.label);
            if let Err(e) = kill(child.pid, Signal::SIGINT) {
                warn!(
                    "Failed to signal {} ({}): {}",
                    child.pid, child.label, e
                );
            }
        }

        let display = self
            .display
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(display) = display {
            if let Err(e) = display.stop() {
                warn!("Error running xpra stop: {:#}", e);
            }
        }

        self.control.close();
    }
}
