pub mod cache;
pub mod copy;
pub mod digest;
pub mod driver;
pub mod error;
pub mod manifest;
pub mod ocidir;
pub mod reference;
pub mod regdist;
pub mod throttle;

pub use cache::ManifestCache;
pub use copy::{CopyOpts, image_copy};
pub use driver::{BlobStream, Client, RateLimit, ReferrerFilter, RegistryDriver};
pub use error::{Error, Result};
pub use manifest::Manifest;
pub use reference::{Reference, Scheme};
pub use regdist::{Auth, HostConfig, HostMap, RegClient, TlsMode};
pub use throttle::{Slot, Throttle};
