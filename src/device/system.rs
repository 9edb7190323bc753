//! Reference-counted owner of the process-wide camera system

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{tracing_log_handler, CameraSystem, SdkLogLevel};
use crate::error::Result;

pub type SystemFactory = Box<dyn Fn() -> Result<Arc<dyn CameraSystem>> + Send + Sync>;

#[derive(Default)]
struct RegistryState {
    system: Option<Arc<dyn CameraSystem>>,
    leases: usize,
}

/// Creates the camera system on the first [`SystemRegistry::acquire`] and tears
/// it down when the last [`SystemLease`] is dropped.
pub struct SystemRegistry {
    factory: SystemFactory,
    state: Mutex<RegistryState>,
}

impl SystemRegistry {
    pub fn new(factory: SystemFactory) -> Arc<Self> {
        Arc::new(Self {
            factory,
            state: Mutex::new(RegistryState::default()),
        })
    }

    pub fn acquire(self: &Arc<Self>, log_level: SdkLogLevel) -> Result<SystemLease> {
        let mut state = self.state.lock();
        let system = match &state.system {
            Some(system) => Arc::clone(system),
            None => {
                let system = (self.factory)()?;
                info!("Camera library version: {}", system.library_version());
                system.register_log_handler(tracing_log_handler());
                system.set_log_level(log_level);
                state.system = Some(Arc::clone(&system));
                system
            }
        };
        state.leases += 1;
        debug!(leases = state.leases, "Camera system acquired");

        Ok(SystemLease {
            registry: Arc::clone(self),
            system,
        })
    }

    pub fn lease_count(&self) -> usize {
        self.state.lock().leases
    }

    pub fn is_live(&self) -> bool {
        self.state.lock().system.is_some()
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.leases = state.leases.saturating_sub(1);
        debug!(leases = state.leases, "Camera system released");
        if state.leases == 0 {
            if let Some(system) = state.system.take() {
                system.unregister_log_handler();
                system.shutdown();
                info!("Camera system shut down");
            }
        }
    }
}

/// One user's share of the camera system
pub struct SystemLease {
    registry: Arc<SystemRegistry>,
    system: Arc<dyn CameraSystem>,
}

impl SystemLease {
    pub fn system(&self) -> &Arc<dyn CameraSystem> {
        &self.system
    }
}

impl Drop for SystemLease {
    fn drop(&mut self) {
        self.registry.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::SimSystem;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn system_is_created_lazily_and_torn_down_once() {
        let created = Arc::new(AtomicUsize::new(0));
        let sim = SimSystem::new();
        let factory_sim = sim.clone();
        let counter = Arc::clone(&created);
        let registry = SystemRegistry::new(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(factory_sim.clone()) as Arc<dyn CameraSystem>)
        }));

        assert!(!registry.is_live());
        let a = registry.acquire(SdkLogLevel::Warn).unwrap();
        let b = registry.acquire(SdkLogLevel::Warn).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.lease_count(), 2);
        assert!(sim.has_log_handler());
        assert_eq!(sim.log_level(), SdkLogLevel::Warn);

        drop(a);
        assert!(registry.is_live());
        assert_eq!(sim.shutdown_count(), 0);

        drop(b);
        assert!(!registry.is_live());
        assert_eq!(sim.shutdown_count(), 1);
        assert!(!sim.has_log_handler());

        let _c = registry.acquire(SdkLogLevel::Off).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }
}
