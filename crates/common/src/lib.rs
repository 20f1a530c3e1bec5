//! Shared data model for the tool-execution fabric: descriptors and
//! argument schemas, request canonicalisation and fingerprints,
//! bit-stable outcomes, caller-facing error kinds and configuration.

pub mod canon;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod outcome;
pub mod paths;
pub mod request;

pub use canon::{canonical_material, fingerprint, Fingerprint};
pub use config::{AdmissionPolicy, CacheConfig, CoreConfig};
pub use descriptor::{ArgKind, ArgSpec, ArgValue, BoundArgs, DescriptorRegistry, ToolDescriptor};
pub use error::{InvokeError, InvokeResult};
pub use outcome::{InvocationState, Outcome, StreamCapture, Termination};
pub use request::{CachePolicy, InvocationRequest, RequestOptions};
