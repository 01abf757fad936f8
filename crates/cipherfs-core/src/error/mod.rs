//! Error types re-exported from across the crate.

pub use crate::crypto::CryptoError;
pub use crate::fs::chunks::ChunkIoError;
pub use crate::fs::content::{ContentCryptoError, FileContext};
pub use crate::fs::name::{NameContext, NameError};
pub use crate::fs::open_file::OpenFileError;
pub use crate::fs::shortening::ShorteningError;
pub use crate::vault::config::VaultOptionsError;
pub use crate::vault::creator::VaultCreationError;
pub use crate::vault::dir_id::DirIdError;
pub use crate::vault::mapper::MapperError;
pub use crate::vault::master_key::{ChangePassphraseError, MasterKeyCreationError};
pub use crate::vault::operations::VaultOperationError;
pub use crate::vault::VaultError;
