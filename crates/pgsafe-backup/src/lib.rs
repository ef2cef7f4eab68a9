//! pgsafe-backup: the backup pipeline and its restore counterpart
//!
//! A run is `pg_dump` → zstd → (AES-CTR + HMAC container) → object storage,
//! followed by a retention pass over the bucket prefix. Restore reverses the
//! chain from a download URL.

pub mod codec;
pub mod dump;
pub mod error;
pub mod notify;
pub mod orchestrator;
mod process;
pub mod prune;
pub mod restore;

pub use codec::{codec_from_config, BuiltinZstd, Codec, ExternalZstd};
pub use dump::{DumpProducer, PgDump};
pub use error::{BackupError, RestoreError, Stage, ToolError};
pub use notify::{notifier_from_config, DiscordNotifier, LogNotifier, Notifier, NotifyError};
pub use orchestrator::{keys_from_material, BackupService, BackupSettings};
pub use prune::{prune_expired, PruneReport};
pub use restore::{DownloadProgress, RestoreRetriever};
