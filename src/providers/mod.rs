//! Platform-facing providers: selector resolution, tagging, boot data and
//! the instance lifecycle built on them.

pub mod bootdata;
pub mod cloud_config;
pub mod devices;
pub mod finder;
pub mod instance;
pub mod kubernetes_version;
pub mod tags;

pub use bootdata::{BootDataBuilder, BootSettings};
pub use finder::{Finder, ResolvedTarget};
pub use instance::{DefaultProvider, Instance, InstanceProvider, ProviderSettings};
pub use kubernetes_version::{KubernetesVersionProvider, KubernetesVersionSource};
pub use tags::TagManager;
