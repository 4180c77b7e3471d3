//! Directory service access.
//!
//! This module defines the narrow [`DirectoryClient`] interface the node uses
//! to publish itself, resolve friends and reach the offline queue, plus an
//! in-memory implementation and a Supabase (PostgREST) binding.

pub mod directory;
pub mod supabase;

pub use directory::*;
pub use supabase::SupabaseDirectory;
