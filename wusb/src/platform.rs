use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use log::{debug, warn};
use crate::backend::Backend;
use crate::context::{ContextInner, UsbContext};
use crate::error::*;
use crate::hotplug::Listener;
use crate::os::OsServices;
use crate::registry::IdentityTable;

#[derive(Debug, Clone)]
pub(crate) struct PlatformConfig {
    pub(crate) identity_table_size: usize,
    pub(crate) max_host_controllers: usize,
    pub(crate) enumerators: Vec<String>,
    pub(crate) hotplug: bool,
    pub(crate) raise_priority: bool,
    pub(crate) poll_interval: Duration,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            identity_table_size: 1021,
            max_host_controllers: 32,
            enumerators: ["USB", "IUSB3", "NUSB3", "HID"].iter().map(|s| s.to_string()).collect(),
            hotplug: true,
            raise_priority: true,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// State shared by every context of a process.
pub(crate) struct PlatformInner {
    pub(crate) os: OsServices,
    pub(crate) config: PlatformConfig,
    pub(crate) identities: IdentityTable,
    /// Host controller instance ids in first-seen order; the index is the bus number minus one.
    pub(crate) host_controllers: Mutex<Vec<String>>,
    /// Serializes every change to the device sets of all contexts.
    pub(crate) registry_lock: Mutex<()>,
    contexts: Mutex<Vec<Weak<ContextInner>>>,
    pub(crate) autoclaim_lock: Mutex<()>,
    available: Vec<(Backend, bool)>,
    listener: Mutex<Option<Listener>>,
}

impl PlatformInner {
    pub(crate) fn register_context(&self, ctx: &Arc<ContextInner>) -> Result {
        let mut contexts = self.contexts.lock()?;
        contexts.retain(|c| c.strong_count() > 0);
        contexts.push(Arc::downgrade(ctx));
        Ok(())
    }

    pub(crate) fn live_contexts(&self) -> Vec<Arc<ContextInner>> {
        match self.contexts.lock() {
            Ok(c) => c.iter().filter_map(|c| c.upgrade()).collect(),
            Err(_) => vec![],
        }
    }

    /// Whether the user mode library of `backend` could be loaded.
    pub(crate) fn is_available(&self, backend: Backend) -> bool {
        self.available.iter()
            .find(|(b, _)| *b == backend)
            .map(|(_, ok)| *ok)
            .unwrap_or(true)
    }
}

impl Drop for PlatformInner {
    fn drop(&mut self) {
        let listener = match self.listener.get_mut() {
            Ok(l) => l.take(),
            Err(e) => e.into_inner().take(),
        };
        if let Some(mut l) = listener {
            l.stop();
        }
        debug!("platform released");
    }
}

/// Process wide USB state: identity table, host controllers, hotplug listener.
#[derive(Clone)]
pub struct Platform {
    inner: Arc<PlatformInner>,
}

impl Platform {
    pub fn new(os: OsServices) -> Result<Self> {
        Self::builder().build(os)
    }

    pub fn builder() -> PlatformBuilder {
        PlatformBuilder::default()
    }

    /// A new context with every present device enumerated.
    pub fn new_context(&self) -> Result<UsbContext> {
        self.context_builder().build()
    }

    pub fn context_builder(&self) -> ContextBuilder {
        ContextBuilder {
            platform: self.inner.clone(),
            initial_scan: true,
        }
    }

    /// Size of the identity table after rounding up to a prime.
    pub fn identity_table_size(&self) -> usize {
        self.inner.identities.size()
    }
}

pub struct PlatformBuilder {
    config: PlatformConfig,
}

impl Default for PlatformBuilder {
    fn default() -> Self {
        Self { config: PlatformConfig::default() }
    }
}

impl PlatformBuilder {
    pub fn identity_table_size(mut self, size: usize) -> Self {
        self.config.identity_table_size = size;
        self
    }

    pub fn max_host_controllers(mut self, max: usize) -> Self {
        self.config.max_host_controllers = max;
        self
    }

    /// Instance id enumerators whose interface notifications are processed.
    pub fn enumerators(mut self, enumerators: &[&str]) -> Self {
        self.config.enumerators = enumerators.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn hotplug(mut self, enable: bool) -> Self {
        self.config.hotplug = enable;
        self
    }

    pub fn raise_priority(mut self, enable: bool) -> Self {
        self.config.raise_priority = enable;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn build(self, os: OsServices) -> Result<Platform> {
        let available = Backend::probed().into_iter().map(|b| {
            let ok = b.ops().init(&os);
            if !ok {
                warn!("{} backend is not available", b);
            }
            (b, ok)
        }).collect();
        let hotplug = self.config.hotplug;
        let raise_priority = self.config.raise_priority;
        let inner = Arc::new(PlatformInner {
            identities: IdentityTable::new(self.config.identity_table_size),
            os,
            config: self.config,
            host_controllers: Mutex::new(vec![]),
            registry_lock: Mutex::new(()),
            contexts: Mutex::new(vec![]),
            autoclaim_lock: Mutex::new(()),
            available,
            listener: Mutex::new(None),
        });
        if hotplug {
            let listener = Listener::start(Arc::downgrade(&inner), &inner.os, raise_priority)?;
            *inner.listener.lock()? = Some(listener);
        }
        Ok(Platform { inner })
    }
}

pub struct ContextBuilder {
    platform: Arc<PlatformInner>,
    initial_scan: bool,
}

impl ContextBuilder {
    /// Start with an empty device set.
    pub fn no_initial_scan(mut self) -> Self {
        self.initial_scan = false;
        self
    }

    pub fn build(self) -> Result<UsbContext> {
        UsbContext::new(self.platform, self.initial_scan)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimOs;

    #[test]
    fn builder_defaults() {
        let sim = SimOs::new();
        let platform = Platform::builder()
            .identity_table_size(1000)
            .hotplug(false)
            .build(sim.services())
            .unwrap();
        assert_eq!(platform.identity_table_size(), 1009);
        assert!(platform.inner.is_available(Backend::Hid));
        assert_eq!(platform.inner.config.enumerators.len(), 4);
    }

    #[test]
    fn dropped_contexts_leave_the_list() {
        let sim = SimOs::new();
        let platform = Platform::builder().hotplug(false).build(sim.services()).unwrap();
        let a = platform.new_context().unwrap();
        let b = platform.context_builder().no_initial_scan().build().unwrap();
        assert_eq!(platform.inner.live_contexts().len(), 2);
        drop(a);
        assert_eq!(platform.inner.live_contexts().len(), 1);
        drop(b);
        assert!(platform.inner.live_contexts().is_empty());
    }
}
