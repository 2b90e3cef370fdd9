//! Shared heap model and error types for the relocation engine.
//!
//! This crate provides the foundational types used by every other component:
//! heap addresses, regions with their size class and age tag, generation
//! identifiers, and the common error type.
//!
//! # Overview
//!
//! - [`Address`] - Heap address in granule-aligned address space
//! - [`Region`] - Contiguous heap extent, unit of allocation and relocation
//! - [`SizeClass`] - Small, medium or large region
//! - [`RegionAge`] - Eden, survivor or old age tag
//! - [`GenerationId`] - Young or old generation
//! - [`GcError`] - Errors surfaced by the engine
//!
//! # Examples
//!
//! ```
//! use gc_types::{Address, Region, RegionAge, RegionId, SizeClass, GenerationId};
//!
//! let region = Region::new(RegionId(1), SizeClass::Small, Address(0x20_0000), 0x20_0000, RegionAge::Eden);
//! let obj = region.alloc_object(64).unwrap();
//! assert!(region.contains(obj));
//! assert_eq!(region.generation(), GenerationId::Young);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod address;
mod error;
mod generation;
mod region;

pub use address::{Address, GRANULE_SHIFT, GRANULE_SIZE, OBJECT_ALIGNMENT};
pub use error::{GcError, GcResult};
pub use generation::GenerationId;
pub use region::{LiveObject, Region, RegionAge, RegionId, SizeClass, MAX_SURVIVOR_AGE};
