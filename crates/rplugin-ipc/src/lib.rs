//! Wire-level plumbing for the remote plugin proxy: the realtime ring, the
//! control pipes, shared-memory mapping, semaphores, the DEFLATE blob codec
//! and the transport that ties a client/helper pair's four temp files
//! together. `rplugin-client` and `rplugin-server` build the actual
//! request/response semantics on top of what's in this crate.

pub mod audio;
pub mod blob;
pub mod opcode;
pub mod pipes;
pub mod ring;
pub mod sem;
pub mod shm;
pub mod transport;

pub use audio::AudioRegion;
pub use opcode::{Channel, Opcode};
pub use pipes::ControlPipe;
pub use ring::{RingHeader, SharedRing};
pub use sem::Semaphore;
pub use shm::SharedMapping;
pub use transport::{parse_helper_arg, ClientTransport, ServerTransport, TransportPaths};

/// Wire representation of a MIDI event inside a ring batch: three raw bytes
/// plus the sample-frame offset within the current process block. Distinct
/// from `rplugin_plugin::MidiEvent` so this crate doesn't need a dependency
/// on the plugin trait crate just to move bytes around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEventWire {
    pub bytes: [u8; 3],
    pub frame_offset: i32,
}
