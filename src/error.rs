//! Centralized error type for the tessera umbrella crate.
//!
//! Wraps the core error so `?` propagates naturally across crate boundaries.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] tessera_core::Error),
}

impl Error {
    /// The underlying backend error.
    pub fn core(&self) -> &tessera_core::Error {
        match self {
            Self::Core(e) => e,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
