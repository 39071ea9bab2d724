// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Group imports of the commonly used traits and types by adding a glob
//! import for use by clients of this library.
//!

pub use super::backend::*;
pub use super::cache::*;
pub use super::config::*;
pub use super::crs::*;
pub use super::error::FilterError;
pub use super::fid::*;
pub use super::fingerprint::*;
pub use super::history::*;
pub use super::host::*;
pub use super::layer::*;
pub use super::orchestrator::*;
pub use super::predicate::*;
pub use super::state::*;
pub use super::subset::*;
pub use super::task::*;
pub use super::translate::*;
pub use super::value::*;
