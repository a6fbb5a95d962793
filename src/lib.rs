//! # fsark — filesystem archiver
//!
//! Engine guarantees (frozen for format 0.7):
//! - All numeric fields on disk are little-endian; never negotiated
//! - Two stacked container layers: volume/block framing with duplicated
//!   32-byte descriptors, and a stream of typed logical records carrying
//!   dictionaries; either copy of a duplicated descriptor is sufficient
//! - A forward-error-correction layer sits between them: every 64 KiB
//!   frame becomes N = K + ecclevel packets (K = 16, 4096 bytes each,
//!   MD5 trailers); any K intact packets reconstruct the frame
//! - Dictionaries are protected by Fletcher-32; readers resynchronize
//!   byte-by-byte over corrupt records and report what they skipped
//! - The archive byte stream is deterministic: it does not depend on the
//!   number of compression workers
//! - On abort, every volume created by the current process is removed

pub mod archinfo;
pub mod checksum;
pub mod codec;
pub mod crypto;
pub mod datafile;
pub mod devinfo;
pub mod dico;
pub mod error;
pub mod exclude;
pub mod fec;
pub mod fsys;
pub mod iobuffer;
pub mod keys;
pub mod layout;
pub mod logmsg;
pub mod options;
pub mod packer;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod restore;
pub mod save;
pub mod status;
pub mod volume;
pub mod xattr;

// Flat re-exports for the most common types.
pub use codec::CompressAlgo;
pub use crypto::EncryptAlgo;
pub use dico::Dico;
pub use error::{FsaError, FsaResult};
pub use fsys::{FsInfo, FsType};
pub use options::Options;
pub use restore::{restore_dir, restore_fs, RestoreSpec, RestoreStats};
pub use save::{save_dir, save_fs, SaveStats};
pub use status::{install_signal_handlers, RunState, Status};
