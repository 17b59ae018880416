//! Swarm file distribution core.
//! No sockets here: the host crate drives I/O and feeds bytes through the codecs.

pub mod codec;
pub mod compression;
pub mod directory;
pub mod fragment;
pub mod protocol;
pub mod report;
pub mod scheduler;
pub mod wire;

pub use codec::{decode_request, decode_response, encode_request, encode_response, CodecError};
pub use directory::{AuditEntry, Directory, DirectoryError, PeerRecord};
pub use fragment::{plan, Fragment, PlanError};
pub use protocol::{DirectoryRequest, DirectoryResponse, PeerRequest, PeerResponse, RequestKind};
pub use report::{DownloadReport, FragmentOutcome, FragmentResult, FragmentStats};
pub use scheduler::{assign_fragments_to_sources, order_by_load, Assignment, ScheduleError};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
