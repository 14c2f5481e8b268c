// Plug-in loaders
//
// A loader turns one plug-in file into registrable objects. The host
// supplies the loader; the registry supplies the registrar that collects
// whatever the file registers, and the context the objects are built
// against.

use std::path::Path;
use std::sync::Arc;

use cookiemonster_core::Context;

/// Collects the objects one plug-in file registers.
pub struct Registrar<T> {
    registered: Vec<T>,
}

impl<T> Registrar<T> {
    pub(crate) fn new() -> Self {
        Self {
            registered: Vec::new(),
        }
    }

    pub fn register(&mut self, item: T) {
        self.registered.push(item);
    }

    pub(crate) fn into_registered(self) -> Vec<T> {
        self.registered
    }
}

/// Loads registrable objects out of a plug-in file.
///
/// The context is handed over before any registered object is published, so
/// loaders can close over it when building their objects.
pub trait PluginLoader<T>: Send + Sync + 'static {
    fn load(
        &self,
        path: &Path,
        registrar: &mut Registrar<T>,
        ctx: &Arc<Context>,
    ) -> anyhow::Result<()>;
}

/// A loader backed by a plain function.
pub struct FnLoader<F> {
    load: F,
}

impl<F> FnLoader<F> {
    pub fn new(load: F) -> Self {
        Self { load }
    }
}

impl<T, F> PluginLoader<T> for FnLoader<F>
where
    F: Fn(&Path, &mut Registrar<T>, &Arc<Context>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn load(
        &self,
        path: &Path,
        registrar: &mut Registrar<T>,
        ctx: &Arc<Context>,
    ) -> anyhow::Result<()> {
        (self.load)(path, registrar, ctx)
    }
}
