//! Ties the four temporary files and two process-shared semaphores together
//! into the one identifier handed to the helper process, and lays out the
//! fixed-size control region those semaphores and the realtime ring share.

use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rplugin_core::{Error, Result, SUFFIX_LEN, TRANSPORT_ID_LEN};

use crate::ring::{RingHeader, SharedRing};
use crate::sem::Semaphore;
use crate::shm::SharedMapping;

const REQUEST_PREFIX: &str = "rplugin-req-";
const RESPONSE_PREFIX: &str = "rplugin-resp-";
const CONTROL_SHM_PREFIX: &str = "/rplugin-ctrl-";
const AUDIO_SHM_PREFIX: &str = "/rplugin-audio-";

/// A short, probably-unique suffix mixing process id, a per-process
/// counter and the low bits of the current time. Not a naming scheme that
/// needs cryptographic unpredictability, only to avoid two helpers spawned
/// in the same instant colliding on a shared-memory name.
fn random_suffix() -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut mixed = u64::from(nanos) ^ u64::from(std::process::id()) ^ u64::from(seq);

    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut suffix = String::with_capacity(SUFFIX_LEN);
    for _ in 0..SUFFIX_LEN {
        suffix.push(ALPHABET[(mixed % ALPHABET.len() as u64) as usize] as char);
        mixed /= ALPHABET.len() as u64;
    }
    suffix
}

/// Byte size of the fixed control region: two semaphores used to signal
/// "server should run" / "client should run" across the ring, followed by
/// the ring header itself. The audio region is sized and mapped separately,
/// lazily, once buffer size and channel counts are known.
const CONTROL_REGION_LEN: usize = 2 * size_of::<libc::sem_t>() + size_of::<RingHeader>();

fn run_server_offset() -> usize {
    0
}

fn run_client_offset() -> usize {
    size_of::<libc::sem_t>()
}

fn ring_header_offset() -> usize {
    2 * size_of::<libc::sem_t>()
}

/// The four temporary files and the 24-character suffix identifier derived
/// from them, in the exact order the wire format expects: request pipe,
/// response pipe, control shm, audio shm.
pub struct TransportPaths {
    pub request_pipe: PathBuf,
    pub response_pipe: PathBuf,
    pub control_shm_name: String,
    pub audio_shm_name: String,
}

impl TransportPaths {
    /// Generates a fresh set of transport filenames under the system temp
    /// directory, each with its own random suffix, the way the client
    /// builds a new transport for each helper it spawns.
    #[must_use]
    pub fn generate() -> Self {
        let tmp_dir = std::env::temp_dir();
        Self {
            request_pipe: tmp_dir.join(format!("{REQUEST_PREFIX}{}", random_suffix())),
            response_pipe: tmp_dir.join(format!("{RESPONSE_PREFIX}{}", random_suffix())),
            control_shm_name: format!("{CONTROL_SHM_PREFIX}{}", random_suffix()),
            audio_shm_name: format!("{AUDIO_SHM_PREFIX}{}", random_suffix()),
        }
    }

    /// Reconstructs the four full filenames from the 24-character suffix
    /// string the helper receives on its command line, by reapplying the
    /// same fixed prefixes `generate` used to build them.
    pub fn reconstruct(suffix_id: &str) -> Result<Self> {
        if suffix_id.len() != TRANSPORT_ID_LEN {
            return Err(Error::ProtocolViolation(format!(
                "transport suffix string has length {} not {TRANSPORT_ID_LEN}",
                suffix_id.len()
            )));
        }
        let tmp_dir = std::env::temp_dir();
        let req = &suffix_id[0..SUFFIX_LEN];
        let resp = &suffix_id[SUFFIX_LEN..2 * SUFFIX_LEN];
        let ctrl = &suffix_id[2 * SUFFIX_LEN..3 * SUFFIX_LEN];
        let audio = &suffix_id[3 * SUFFIX_LEN..4 * SUFFIX_LEN];
        Ok(Self {
            request_pipe: tmp_dir.join(format!("{REQUEST_PREFIX}{req}")),
            response_pipe: tmp_dir.join(format!("{RESPONSE_PREFIX}{resp}")),
            control_shm_name: format!("{CONTROL_SHM_PREFIX}{ctrl}"),
            audio_shm_name: format!("{AUDIO_SHM_PREFIX}{audio}"),
        })
    }

    /// Builds the 24-character suffix string handed to the helper as part
    /// of its single command-line argument: the last six characters of
    /// each of the four filenames, concatenated in the fixed order above.
    pub fn suffix_id(&self) -> Result<String> {
        let mut id = String::with_capacity(TRANSPORT_ID_LEN);
        for source in [
            self.request_pipe.as_os_str().to_string_lossy().to_string(),
            self.response_pipe.as_os_str().to_string_lossy().to_string(),
            self.control_shm_name.clone(),
            self.audio_shm_name.clone(),
        ] {
            if source.len() < SUFFIX_LEN {
                return Err(Error::ProtocolViolation(format!(
                    "transport filename {source:?} shorter than suffix length"
                )));
            }
            id.push_str(&source[source.len() - SUFFIX_LEN..]);
        }
        Ok(id)
    }
}

/// The client's side of a transport: owner of the temp files, the
/// semaphores, and the mapped control region. Unlinks everything on drop.
pub struct ClientTransport {
    paths: TransportPaths,
    control: SharedMapping,
}

impl ClientTransport {
    /// Creates both FIFOs and the control shared-memory region, initializes
    /// both semaphores and the ring header, and returns the owning handle.
    pub fn create(paths: TransportPaths) -> Result<Self> {
        crate::pipes::make_fifo(&paths.request_pipe)?;
        crate::pipes::make_fifo(&paths.response_pipe)?;
        let control = SharedMapping::create(&paths.control_shm_name, CONTROL_REGION_LEN)?;
        unsafe {
            let run_server = control.as_ptr().add(run_server_offset()).cast::<libc::sem_t>();
            let run_client = control.as_ptr().add(run_client_offset()).cast::<libc::sem_t>();
            Semaphore::init(run_server, 0)?;
            Semaphore::init(run_client, 0)?;
            RingHeader::init_at(
                control.as_ptr().add(ring_header_offset()).cast::<RingHeader>(),
            );
        }
        Ok(Self { paths, control })
    }

    #[must_use]
    pub fn paths(&self) -> &TransportPaths {
        &self.paths
    }

    /// Semaphore the client posts after a ring write, waking the server.
    #[must_use]
    pub fn run_server_sem(&self) -> Semaphore {
        unsafe {
            Semaphore::from_raw(
                self.control.as_ptr().add(run_server_offset()).cast::<libc::sem_t>(),
            )
        }
    }

    /// Semaphore the server posts to wake the client back up.
    #[must_use]
    pub fn run_client_sem(&self) -> Semaphore {
        unsafe {
            Semaphore::from_raw(
                self.control.as_ptr().add(run_client_offset()).cast::<libc::sem_t>(),
            )
        }
    }

    #[must_use]
    pub fn ring(&self) -> SharedRing {
        unsafe {
            SharedRing::from_raw(
                self.control
                    .as_ptr()
                    .add(ring_header_offset())
                    .cast::<RingHeader>(),
            )
        }
    }
}

impl Drop for ClientTransport {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.paths.request_pipe);
        let _ = std::fs::remove_file(&self.paths.response_pipe);
        let _ = crate::shm::unlink(&self.paths.control_shm_name);
    }
}

/// The helper's side of a transport: everything here was created by the
/// client, so the helper only opens and maps, never unlinks.
pub struct ServerTransport {
    control: SharedMapping,
}

impl ServerTransport {
    pub fn open(control_shm_path: &Path) -> Result<Self> {
        let control = SharedMapping::open_existing(control_shm_path, CONTROL_REGION_LEN)?;
        Ok(Self { control })
    }

    #[must_use]
    pub fn run_server_sem(&self) -> Semaphore {
        unsafe {
            Semaphore::from_raw(
                self.control.as_ptr().add(run_server_offset()).cast::<libc::sem_t>(),
            )
        }
    }

    #[must_use]
    pub fn run_client_sem(&self) -> Semaphore {
        unsafe {
            Semaphore::from_raw(
                self.control.as_ptr().add(run_client_offset()).cast::<libc::sem_t>(),
            )
        }
    }

    #[must_use]
    pub fn ring(&self) -> SharedRing {
        unsafe {
            SharedRing::from_raw(
                self.control
                    .as_ptr()
                    .add(ring_header_offset())
                    .cast::<RingHeader>(),
            )
        }
    }
}

/// Parses the helper's single positional argument of the form
/// `pluginId,transportSuffixes` back into the 24-char suffix string, per
/// spec §6's argv shape.
pub fn parse_helper_arg(arg: &str) -> Result<(String, String)> {
    let (plugin_id, suffixes) = arg
        .rsplit_once(',')
        .ok_or_else(|| Error::ProtocolViolation(format!("malformed helper argument {arg:?}")))?;
    if suffixes.len() != TRANSPORT_ID_LEN {
        return Err(Error::ProtocolViolation(format!(
            "transport suffix string has length {} not {TRANSPORT_ID_LEN}",
            suffixes.len()
        )));
    }
    Ok((plugin_id.to_string(), suffixes.to_string()))
}
