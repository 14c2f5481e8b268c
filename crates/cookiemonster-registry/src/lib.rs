// cookiemonster-registry - Priority-ordered plug-in registries
//
// A registry holds an immutable, priority-ordered snapshot of registrable
// objects (rules, enrichment loaders, notification receivers). Snapshots
// are replaced atomically; readers keep whatever snapshot they took for the
// duration of a dispatch. The directory registry populates itself from a
// watched plug-in directory.

mod error;
mod loader;
mod registry;
mod watcher;

pub use error::RegistryError;
pub use loader::{FnLoader, PluginLoader, Registrar};
pub use registry::Registry;
pub use watcher::DirectoryRegistry;
