mod digest;
mod error;
mod manifest;
mod step;
mod version;

pub use digest::{sha256_file, sha256_hex};
pub use error::UpgradeError;
pub use manifest::{ScriptletDeclaration, VersionManifest, MANIFEST_FILE_NAME};
pub use step::UpgradeStep;
pub use version::Version;

#[cfg(test)]
mod tests;
