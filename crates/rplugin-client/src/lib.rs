//! Host-side half of the remote plugin proxy: spawning and supervising the
//! helper process, and the typed request/response API a native plugin host
//! calls against it.

pub mod endpoint;
pub mod lifecycle;

pub use endpoint::ClientEndpoint;
pub use lifecycle::{find_helper_binary, helper_search_paths, HelperLifecycle, HelperState};
