//! Session output folders and their run reports

pub mod bundle;

pub use bundle::{BundleError, SessionReport};
