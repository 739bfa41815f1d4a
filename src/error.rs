use std::path::PathBuf;

/// Domain failures that abort a run.
#[derive(thiserror::Error, Debug)]
pub enum VtonError {
    #[error("Malformed manifest line {line} in {path}: expected `<person> <garment>`, got {content:?}")]
    MalformedManifest {
        path: PathBuf,
        line: usize,
        content: String,
    },
    #[error("Index {index} out of range for dataset of {len} pairs")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Dataset is empty, nothing to train on")]
    EmptyDataset,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
