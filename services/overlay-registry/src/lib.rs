//! # Overlay Registry
//!
//! A read-only Docker Registry v2 endpoint which serves synthetic images.
//!
//! Each image it serves is the layers of an "executable" image stacked on a
//! fixed set of shared base layers. The combined image is composed on every
//! request from the upstream registries and never stored: manifests and
//! configs are generated, and layer blobs are streamed through from the
//! registry they live in.
//!
//! ## Example
//!
//! ```no_run
//! use overlay_registry::{BaseLayerMap, Executable, RegistryBuilder, RemoteSource};
//! use registry_client::{Keychain, Platform, Reference, RegistryClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = RegistryClient::new(Keychain::from_env()?);
//! let executable = Reference::parse("gcr.io/proj/app:v2")?;
//!
//! let registry = RegistryBuilder::new()
//!     .source(RemoteSource::new(client, Platform::default()))
//!     .base_layers(BaseLayerMap::from_dir(camino::Utf8Path::new("/etc/recipe"))?)
//!     .executable(Executable::Pinned(executable))
//!     .build();
//!
//! // Use the registry service with axum or any tower-compatible server
//! # Ok(())
//! # }
//! ```

mod api;
mod blob;
pub mod compose;
pub mod config;
mod error;
mod manifest;
mod memory;
pub mod resolve;
mod route;
pub mod source;

pub use api::{Executable, RegistryBuilder};
pub use compose::{ComposeError, ImageComposer, VirtualImage};
pub use config::{BaseLayerMap, ConfigError};
pub use error::{RegistryError, RegistryResult};
pub use memory::MemorySource;
pub use resolve::{LayerResolver, ResolutionError};
pub use source::{ImageSource, Layer, RemoteSource, SourceError};
