//! Placeholder module: deferred binding to a real implementation.
//!
//! Until the real module id arrives, every set-param and event
//! registration is cached in order. Binding loads the implementation
//! from the module database, optionally forces a worker re-launch when
//! the module needs a bigger stack, then replays the caches.

use std::fmt;

use aria_sync::{Error, Result};
use aria_wire::packet::ClientId;

use crate::topo::Module;

/// Module database the engine loads real implementations from. The
/// database itself (catalog, storage, dynamic loading) lives outside the
/// container; only this seam is consumed.
pub trait ModuleDb: Send + Sync {
    fn load(&self, module_id: u32) -> Result<Box<dyn Module>>;
}

/// An event registration deferred until binding.
#[derive(Debug)]
pub struct CachedEventReg {
    pub event_id: u32,
    pub client: ClientId,
    pub config: Option<Vec<u8>>,
}

/// A slot whose real module arrives later.
pub struct Placeholder {
    instance_id: u32,
    real_module_id: Option<u32>,
    /// Loaded but not yet replayed into (between begin_bind and
    /// finish_bind, possibly across a worker re-launch).
    staged: Option<Box<dyn Module>>,
    module: Option<Box<dyn Module>>,
    cached_params: Vec<(u32, Vec<u8>)>,
    cached_events: Vec<CachedEventReg>,
    /// Set when the slot was disabled at sub-graph start with no real id;
    /// enabling such a slot before binding is refused.
    pub disabled_at_start: bool,
}

impl Placeholder {
    pub fn new(instance_id: u32) -> Self {
        Self {
            instance_id,
            real_module_id: None,
            staged: None,
            module: None,
            cached_params: Vec::new(),
            cached_events: Vec::new(),
            disabled_at_start: false,
        }
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    pub fn is_bound(&self) -> bool {
        self.module.is_some()
    }

    pub fn real_module_id(&self) -> Option<u32> {
        self.real_module_id
    }

    pub fn bound_module(&mut self) -> Option<&mut dyn Module> {
        match &mut self.module {
            Some(module) => Some(module.as_mut()),
            None => None,
        }
    }

    pub fn bound_module_ref(&self) -> Option<&dyn Module> {
        self.module.as_deref()
    }

    /// Pre-bind: queue the param. Post-bind: apply directly.
    pub fn set_param(&mut self, param_id: u32, payload: &[u8]) -> Result<()> {
        match &mut self.module {
            Some(module) => module.set_param(param_id, payload),
            None => {
                self.cached_params.push((param_id, payload.to_vec()));
                Ok(())
            }
        }
    }

    /// Queue an event registration for replay at bind time.
    pub fn cache_event(&mut self, reg: CachedEventReg) {
        self.cached_events.push(reg);
    }

    /// May this slot be enabled right now.
    pub fn may_enable(&self) -> bool {
        self.is_bound() || !self.disabled_at_start
    }

    /// Load the real module, returning the stack it needs so the caller
    /// can decide whether the worker must re-launch before
    /// [`Self::finish_bind`].
    pub fn begin_bind(&mut self, real_module_id: u32, db: &dyn ModuleDb) -> Result<usize> {
        if self.is_bound() || self.staged.is_some() {
            tracing::error!(instance = self.instance_id, "placeholder already bound");
            return Err(Error::Unexpected);
        }
        let module = db.load(real_module_id)?;
        let stack = module.stack_bytes();
        tracing::debug!(
            instance = self.instance_id,
            real_module_id = format_args!("{real_module_id:#x}"),
            stack,
            "loaded real module behind placeholder"
        );
        self.real_module_id = Some(real_module_id);
        self.staged = Some(module);
        Ok(stack)
    }

    /// Replay cached params in arrival order, then hand each cached event
    /// registration to `on_event_reg` (the container re-registers it and
    /// raises currently-known state such as the output media format).
    pub fn finish_bind(&mut self, mut on_event_reg: impl FnMut(&CachedEventReg)) -> Result<()> {
        let mut module = self.staged.take().ok_or(Error::Unexpected)?;
        for (param_id, payload) in self.cached_params.drain(..) {
            if let Err(e) = module.set_param(param_id, &payload) {
                tracing::warn!(
                    instance = self.instance_id,
                    param_id = format_args!("{param_id:#x}"),
                    error = %e,
                    "cached param rejected by real module"
                );
            }
        }
        for reg in &self.cached_events {
            on_event_reg(reg);
        }
        self.cached_events.clear();
        self.module = Some(module);
        tracing::debug!(instance = self.instance_id, "placeholder bound");
        Ok(())
    }

    /// Forget the real module and every cache. Only legal in stopped
    /// state; the container enforces that before calling.
    pub fn reset(&mut self) {
        self.real_module_id = None;
        self.staged = None;
        self.module = None;
        self.cached_params.clear();
        self.cached_events.clear();
    }

    #[cfg(test)]
    pub fn cached_param_count(&self) -> usize {
        self.cached_params.len()
    }
}

impl fmt::Debug for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Placeholder")
            .field("instance_id", &self.instance_id)
            .field("real_module_id", &self.real_module_id)
            .field("bound", &self.is_bound())
            .field("cached_params", &self.cached_params.len())
            .field("cached_events", &self.cached_events.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topo::ProcCtx;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Recorder {
        applied: Arc<Mutex<Vec<u32>>>,
        stack: usize,
    }

    impl Module for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        fn process(&mut self, _ctx: &mut ProcCtx<'_>) -> Result<()> {
            Ok(())
        }
        fn set_param(&mut self, param_id: u32, _payload: &[u8]) -> Result<()> {
            self.applied.lock().push(param_id);
            Ok(())
        }
        fn stack_bytes(&self) -> usize {
            self.stack
        }
    }

    struct OneModuleDb {
        applied: Arc<Mutex<Vec<u32>>>,
        stack: usize,
    }

    impl ModuleDb for OneModuleDb {
        fn load(&self, module_id: u32) -> Result<Box<dyn Module>> {
            if module_id == 0xabcd {
                Ok(Box::new(Recorder {
                    applied: Arc::clone(&self.applied),
                    stack: self.stack,
                }))
            } else {
                Err(Error::Failed)
            }
        }
    }

    #[test]
    fn params_cached_then_replayed_in_order() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let db = OneModuleDb {
            applied: Arc::clone(&applied),
            stack: 8 * 1024,
        };
        let mut ph = Placeholder::new(5);
        ph.set_param(0xa, &[1]).unwrap();
        ph.set_param(0xb, &[2]).unwrap();
        ph.set_param(0xc, &[3]).unwrap();
        assert_eq!(ph.cached_param_count(), 3);

        let stack = ph.begin_bind(0xabcd, &db).unwrap();
        assert_eq!(stack, 8 * 1024);
        let mut regs = 0;
        ph.finish_bind(|_| regs += 1).unwrap();
        assert!(ph.is_bound());
        assert_eq!(*applied.lock(), vec![0xa, 0xb, 0xc]);
    }

    #[test]
    fn cached_events_replay_at_bind() {
        let db = OneModuleDb {
            applied: Arc::new(Mutex::new(Vec::new())),
            stack: 1024,
        };
        let mut ph = Placeholder::new(5);
        ph.cache_event(CachedEventReg {
            event_id: 0x77,
            client: ClientId::default(),
            config: None,
        });
        ph.begin_bind(0xabcd, &db).unwrap();
        let mut seen = Vec::new();
        ph.finish_bind(|reg| seen.push(reg.event_id)).unwrap();
        assert_eq!(seen, vec![0x77]);
    }

    #[test]
    fn unknown_module_id_fails_bind() {
        let db = OneModuleDb {
            applied: Arc::new(Mutex::new(Vec::new())),
            stack: 1024,
        };
        let mut ph = Placeholder::new(5);
        assert_eq!(ph.begin_bind(0x1, &db).unwrap_err(), Error::Failed);
        assert!(!ph.is_bound());
    }

    #[test]
    fn enable_refused_when_disabled_at_start_without_real_id() {
        let mut ph = Placeholder::new(5);
        ph.disabled_at_start = true;
        assert!(!ph.may_enable());
        let db = OneModuleDb {
            applied: Arc::new(Mutex::new(Vec::new())),
            stack: 1024,
        };
        ph.begin_bind(0xabcd, &db).unwrap();
        ph.finish_bind(|_| {}).unwrap();
        assert!(ph.may_enable());
    }

    #[test]
    fn reset_forgets_everything() {
        let db = OneModuleDb {
            applied: Arc::new(Mutex::new(Vec::new())),
            stack: 1024,
        };
        let mut ph = Placeholder::new(5);
        ph.set_param(0xa, &[]).unwrap();
        ph.begin_bind(0xabcd, &db).unwrap();
        ph.finish_bind(|_| {}).unwrap();
        ph.reset();
        assert!(!ph.is_bound());
        assert_eq!(ph.real_module_id(), None);
        assert_eq!(ph.cached_param_count(), 0);
    }
}
