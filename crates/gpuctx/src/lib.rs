mod acquire;
mod context;
pub mod offscreen;
mod types;

pub use acquire::{ContextAcquirer, ContextError};
pub use context::{ContextProvider, DeviceHandles, GraphicsContext, ProvidedContext, WgpuProvider};
pub use types::{AdapterKind, AdapterProfile, Provider};
