//! # Ordered Registries
//!
//! A [`Registry`] holds an ordered list of interceptor or hook registrations. Order is
//! significant: the first registered interceptor is the outermost one.
//!
//! Each entry is identified by the type it builds. Positional inserts (`insert_before`,
//! `insert_after`) and removal refer to that type; an anchor that is not registered is an
//! error and leaves the registry untouched.
//!
//! Registries are shared between every in-flight call. Mutations take a write lock and
//! [`Registry::prepare`] works on a snapshot, so calls already running are never affected by
//! a concurrent mutation.
use crate::{
    hooks::{Hook, HookClass},
    interceptor::{Interceptor, InterceptorClass},
    request::Request,
};
use std::{
    any::{TypeId, type_name},
    fmt,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("'{0}' is not registered")]
    NotFound(&'static str),
}

type Factory<T> = Arc<dyn Fn(&Request) -> Box<T> + Send + Sync>;

/// A registered interceptor or hook type together with its options.
pub struct Registration<T: ?Sized> {
    id: TypeId,
    name: &'static str,
    factory: Factory<T>,
}

impl<T: ?Sized> Clone for Registration<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name,
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Registration<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<T: ?Sized> Registration<T> {
    /// Type name of the registered class.
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn is<C: 'static>(&self) -> bool {
        self.id == TypeId::of::<C>()
    }
}

impl Registration<dyn Interceptor> {
    pub fn interceptor<C: InterceptorClass>(options: C::Options) -> Self {
        Self {
            id: TypeId::of::<C>(),
            name: type_name::<C>(),
            factory: Arc::new(move |request: &Request| {
                Box::new(C::build(request, &options)) as Box<dyn Interceptor>
            }),
        }
    }
}

impl Registration<dyn Hook> {
    pub fn hook<C: HookClass>(options: C::Options) -> Self {
        Self {
            id: TypeId::of::<C>(),
            name: type_name::<C>(),
            factory: Arc::new(move |request: &Request| {
                Box::new(C::build(request, &options)) as Box<dyn Hook>
            }),
        }
    }
}

/// An ordered, thread-safe list of registrations.
pub struct Registry<T: ?Sized> {
    entries: RwLock<Vec<Registration<T>>>,
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.list()).finish()
    }
}

impl<T: ?Sized> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a registration at the end (innermost position).
    pub fn register(&self, registration: Registration<T>) {
        debug!(name = registration.name, "Registering");
        self.write().push(registration);
    }

    /// Inserts a registration right before the first entry of type `A`.
    pub fn insert_before<A: 'static>(
        &self,
        registration: Registration<T>,
    ) -> Result<(), RegistryError> {
        let mut entries = self.write();
        let index = position::<A, T>(&entries)?;
        entries.insert(index, registration);
        Ok(())
    }

    /// Inserts a registration right after the first entry of type `A`.
    pub fn insert_after<A: 'static>(
        &self,
        registration: Registration<T>,
    ) -> Result<(), RegistryError> {
        let mut entries = self.write();
        let index = position::<A, T>(&entries)?;
        entries.insert(index + 1, registration);
        Ok(())
    }

    /// Removes the first entry of type `A`.
    pub fn remove<A: 'static>(&self) -> Result<(), RegistryError> {
        let mut entries = self.write();
        let index = position::<A, T>(&entries)?;
        entries.remove(index);
        Ok(())
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    /// Type names of the registered entries, in order.
    pub fn list(&self) -> Vec<&'static str> {
        self.read().iter().map(Registration::name).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Builds fresh instances of every registered entry, in order, for one call.
    pub fn prepare(&self, request: &Request) -> Vec<Box<T>> {
        let snapshot = self.read().clone();
        snapshot
            .iter()
            .map(|registration| (registration.factory)(request))
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Registration<T>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Registration<T>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn position<A: 'static, T: ?Sized>(entries: &[Registration<T>]) -> Result<usize, RegistryError> {
    entries
        .iter()
        .position(|entry| entry.is::<A>())
        .ok_or(RegistryError::NotFound(type_name::<A>()))
}
