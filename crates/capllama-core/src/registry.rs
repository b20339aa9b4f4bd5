//! Process-wide table of live contexts.
//!
//! One `Mutex` guards the map and the limit. Handles are `Arc<Context>`, so a
//! context released while an operation runs stays valid for that operation
//! and is unreachable for every later lookup.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use capllama_abi::ModelDescriptor;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::delegate::Session;
use crate::errors::{PluginError, Result};

pub const DEFAULT_CONTEXT_LIMIT: usize = 10;

/// Positive context identifier chosen by the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ContextId(i64);

impl ContextId {
    pub fn new(raw: i64) -> Result<Self> {
        if raw <= 0 {
            return Err(PluginError::invalid(format!("contextId must be positive, got {raw}")));
        }
        Ok(Self(raw))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Context {
    id: ContextId,
    model: ModelDescriptor,
    multimodal: AtomicBool,
    vocoder: AtomicBool,
    released: AtomicBool,
    stop: Arc<AtomicBool>,
    session: Arc<AsyncMutex<Box<dyn Session>>>,
}

impl Context {
    fn new(id: ContextId, model: ModelDescriptor, session: Box<dyn Session>) -> Self {
        Self {
            id,
            model,
            multimodal: AtomicBool::new(false),
            vocoder: AtomicBool::new(false),
            released: AtomicBool::new(false),
            stop: Arc::new(AtomicBool::new(false)),
            session: Arc::new(AsyncMutex::new(session)),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn model(&self) -> &ModelDescriptor {
        &self.model
    }

    pub fn is_multimodal_enabled(&self) -> bool {
        self.multimodal.load(Ordering::SeqCst)
    }

    pub fn set_multimodal_enabled(&self, on: bool) {
        self.multimodal.store(on, Ordering::SeqCst);
    }

    pub fn is_vocoder_enabled(&self) -> bool {
        self.vocoder.load(Ordering::SeqCst)
    }

    pub fn set_vocoder_enabled(&self, on: bool) {
        self.vocoder.store(on, Ordering::SeqCst);
    }

    /// Observed by the token callback of a running completion.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Resets a stop request before a new completion. A released context stays stopped.
    pub fn clear_stop(&self) {
        self.stop.store(false, Ordering::SeqCst);
        if self.is_released() {
            self.stop.store(true, Ordering::SeqCst);
        }
    }

    /// Set once the context leaves the registry; queued operations must not run after it.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn mark_released(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Exclusive access to the session; waits for the operation in flight.
    pub async fn lock_session(&self) -> OwnedMutexGuard<Box<dyn Session>> {
        Arc::clone(&self.session).lock_owned().await
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("model", &self.model.path)
            .field("multimodal", &self.is_multimodal_enabled())
            .field("vocoder", &self.is_vocoder_enabled())
            .finish()
    }
}

struct Inner {
    contexts: HashMap<ContextId, Arc<Context>>,
    limit: usize,
}

pub struct ContextRegistry {
    inner: Mutex<Inner>,
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_LIMIT)
    }
}

impl ContextRegistry {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                contexts: HashMap::new(),
                limit,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cheap pre-flight before loading a model; `create` checks again.
    pub fn ensure_can_create(&self, id: ContextId) -> Result<()> {
        Self::admit(&self.lock(), id)
    }

    fn admit(inner: &Inner, id: ContextId) -> Result<()> {
        if inner.contexts.contains_key(&id) {
            return Err(PluginError::invalid(format!("context {id} already exists")));
        }
        if inner.contexts.len() >= inner.limit {
            return Err(PluginError::CapacityExceeded { limit: inner.limit });
        }
        Ok(())
    }

    /// On failure the session is dropped and the registry is unchanged.
    pub fn create(&self, id: ContextId, model: ModelDescriptor, session: Box<dyn Session>) -> Result<Arc<Context>> {
        let mut inner = self.lock();
        Self::admit(&inner, id)?;
        let ctx = Arc::new(Context::new(id, model, session));
        inner.contexts.insert(id, Arc::clone(&ctx));
        Ok(ctx)
    }

    pub fn get(&self, id: ContextId) -> Result<Arc<Context>> {
        self.lock().contexts.get(&id).cloned().ok_or(PluginError::ContextNotFound)
    }

    /// Returns the detached handle, marked released and stopped. The session
    /// is dropped once the last holder lets go of it.
    pub fn remove(&self, id: ContextId) -> Result<Arc<Context>> {
        let ctx = self.lock().contexts.remove(&id).ok_or(PluginError::ContextNotFound)?;
        ctx.mark_released();
        Ok(ctx)
    }

    /// Empties the registry; returns what was removed.
    pub fn remove_all(&self) -> Vec<Arc<Context>> {
        let drained = std::mem::take(&mut self.lock().contexts);
        let drained: Vec<Arc<Context>> = drained.into_values().collect();
        for ctx in &drained {
            ctx.mark_released();
        }
        drained
    }

    /// Never evicts: a lower limit only blocks new contexts.
    pub fn set_limit(&self, limit: usize) {
        self.lock().limit = limit;
    }

    pub fn limit(&self) -> usize {
        self.lock().limit
    }

    pub fn len(&self) -> usize {
        self.lock().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self.lock().contexts.keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counted(Arc<AtomicUsize>);

    impl Session for Counted {}

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn id(n: i64) -> ContextId {
        ContextId::new(n).unwrap()
    }

    fn session() -> Box<dyn Session> {
        Box::new(Counted(Arc::new(AtomicUsize::new(0))))
    }

    #[test]
    fn rejects_non_positive_ids() {
        assert!(ContextId::new(0).is_err());
        assert!(ContextId::new(-3).is_err());
        assert_eq!(ContextId::new(4).unwrap().get(), 4);
    }

    #[test]
    fn capacity_is_enforced_and_release_frees_a_slot() {
        let reg = ContextRegistry::new(1);
        reg.create(id(1), ModelDescriptor::default(), session()).unwrap();
        let err = reg.create(id(2), ModelDescriptor::default(), session()).unwrap_err();
        assert_eq!(err, PluginError::CapacityExceeded { limit: 1 });
        assert_eq!(reg.len(), 1);

        reg.remove(id(1)).unwrap();
        reg.create(id(2), ModelDescriptor::default(), session()).unwrap();
        assert_eq!(reg.ids(), vec![id(2)]);
    }

    #[test]
    fn failed_insert_drops_session_without_side_effects() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let reg = ContextRegistry::new(0);
        let res = reg.create(id(1), ModelDescriptor::default(), Box::new(Counted(Arc::clone(&dropped))));
        assert!(res.is_err());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn duplicate_live_id_is_rejected() {
        let reg = ContextRegistry::default();
        reg.create(id(5), ModelDescriptor::default(), session()).unwrap();
        let err = reg.create(id(5), ModelDescriptor::default(), session()).unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMETERS");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn lowering_limit_never_evicts() {
        let reg = ContextRegistry::new(3);
        for n in 1..=3 {
            reg.create(id(n), ModelDescriptor::default(), session()).unwrap();
        }
        reg.set_limit(1);
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.limit(), 1);
        assert!(matches!(
            reg.ensure_can_create(id(9)),
            Err(PluginError::CapacityExceeded { limit: 1 })
        ));
    }

    #[test]
    fn remove_all_is_idempotent() {
        let reg = ContextRegistry::default();
        reg.create(id(1), ModelDescriptor::default(), session()).unwrap();
        reg.create(id(2), ModelDescriptor::default(), session()).unwrap();
        assert_eq!(reg.remove_all().len(), 2);
        assert!(reg.remove_all().is_empty());
        assert_eq!(reg.get(id(1)).unwrap_err(), PluginError::ContextNotFound);
        assert_eq!(reg.remove(id(2)).unwrap_err(), PluginError::ContextNotFound);
    }

    #[test]
    fn session_outlives_removal_while_held() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let reg = ContextRegistry::default();
        let held = reg
            .create(id(1), ModelDescriptor::default(), Box::new(Counted(Arc::clone(&dropped))))
            .unwrap();
        drop(reg.remove(id(1)).unwrap());
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        drop(held);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removal_marks_released_and_keeps_it_stopped() {
        let reg = ContextRegistry::default();
        let a = reg.create(id(1), ModelDescriptor::default(), session()).unwrap();
        let b = reg.create(id(2), ModelDescriptor::default(), session()).unwrap();
        a.request_stop();
        a.clear_stop();
        assert!(!a.stop_flag().load(Ordering::SeqCst));

        reg.remove(id(1)).unwrap();
        assert!(a.is_released());
        a.clear_stop();
        assert!(a.stop_flag().load(Ordering::SeqCst));

        assert!(!b.is_released());
        reg.remove_all();
        assert!(b.is_released());
        b.clear_stop();
        assert!(b.stop_flag().load(Ordering::SeqCst));
    }

    #[test]
    fn flags_start_unset() {
        let reg = ContextRegistry::default();
        let ctx = reg.create(id(1), ModelDescriptor::default(), session()).unwrap();
        assert!(!ctx.is_multimodal_enabled());
        assert!(!ctx.is_vocoder_enabled());
        ctx.set_multimodal_enabled(true);
        assert!(reg.get(id(1)).unwrap().is_multimodal_enabled());
    }
}
