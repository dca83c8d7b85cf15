use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Result;

use crate::marshal::DispatchEvent;

/// What a dispatch target handed back, before the bridge checks the integer contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetReply {
    Integer(i64),
    /// Anything that is not an integer in the script runtime.
    Other { type_name: String },
}

/// Handler for engine dispatch events.
pub trait DispatchTarget {
    /// Human readable name used in logs.
    fn describe(&self) -> String {
        "native target".to_string()
    }

    fn invoke(&self, event: &DispatchEvent) -> Result<TargetReply>;
}

impl<F> DispatchTarget for F
where
    F: Fn(&DispatchEvent) -> Result<TargetReply>,
{
    fn invoke(&self, event: &DispatchEvent) -> Result<TargetReply> {
        self(event)
    }
}

/// Single-slot holder for the current dispatch target.
#[derive(Default)]
pub struct CallbackRegistry {
    current: Option<Rc<dyn DispatchTarget>>,
    generation: u64,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `target` current and hands back the previous occupant, if any.
    ///
    /// The registry keeps its own `Rc` to the target for as long as it stays current.
    pub fn register(&mut self, target: Rc<dyn DispatchTarget>) -> Option<Rc<dyn DispatchTarget>> {
        log::debug!("registering dispatch target: {}", target.describe());
        self.generation = self.generation.wrapping_add(1);
        self.current.replace(target)
    }

    pub fn current(&self) -> Option<Rc<dyn DispatchTarget>> {
        self.current.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.current.is_some()
    }

    /// Bumped on every registration.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn clear(&mut self) -> Option<Rc<dyn DispatchTarget>> {
        self.current.take()
    }
}

/// Shared handle to the registry, cloned into the script runtime's API closures.
#[derive(Clone, Default)]
pub struct RegistryHandle(Rc<RefCell<CallbackRegistry>>);

impl RegistryHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `target`; the previous occupant is dropped after the borrow ends so its
    /// destructor can never observe a locked registry.
    pub fn register(&self, target: Rc<dyn DispatchTarget>) {
        let previous = self.0.borrow_mut().register(target);
        drop(previous);
    }

    pub fn current(&self) -> Option<Rc<dyn DispatchTarget>> {
        self.0.borrow().current()
    }

    pub fn is_ready(&self) -> bool {
        self.0.borrow().is_ready()
    }

    pub fn generation(&self) -> u64 {
        self.0.borrow().generation()
    }

    pub fn clear(&self) {
        let previous = self.0.borrow_mut().clear();
        drop(previous);
    }
}
