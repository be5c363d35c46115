//! Error types for configuration and dataset problems.
//!
//! Framework failures (burn, image decoding inside a batch) travel as
//! `anyhow::Error`; everything the user can fix by pointing the program at a
//! different directory or config is a [`PipelineError`].

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// A directory the pipeline needs does not exist
    #[error("directory not found: {0}")]
    MissingDirectory(PathBuf),

    /// A split directory lacks one of the class subfolders
    #[error("expected class folder '{class}' under {dir}")]
    MissingClassFolder { dir: PathBuf, class: String },

    /// A split ended up with no images at all
    #[error("no images found for the {0} split")]
    EmptySplit(String),

    /// An image could not be opened or decoded
    #[error("failed to load image at '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// Invalid hyperparameter value
    #[error("configuration error: {0}")]
    Config(String),

    /// Grad-CAM target layer is not a convolution of the backbone
    #[error("unknown layer '{name}', expected one of: {available}")]
    UnknownLayer { name: String, available: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_class_message_names_folder() {
        let err = PipelineError::MissingClassFolder {
            dir: PathBuf::from("chest_xray/train"),
            class: "PNEUMONIA".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("PNEUMONIA"));
        assert!(msg.contains("chest_xray/train"));
    }
}
