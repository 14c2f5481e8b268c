use thiserror::Error;

/// Failures setting up or rescanning a plug-in directory.
///
/// Load failures inside a plug-in file are not errors at this level: the
/// file is skipped with a warning and its previous objects survive.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid plug-in file pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("plug-in directory watch failure: {0}")]
    Watch(#[from] notify::Error),

    #[error("plug-in directory scan failure: {0}")]
    Scan(#[from] std::io::Error),
}
