#![deny(rust_2018_idioms)]

#[macro_use]
extern crate anyhow;

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate lazy_static;

#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

#[cfg(test)]
#[macro_use]
pub mod test_utils;

pub mod cancel;
pub mod commit;
pub mod db;
pub mod diff;
pub mod dirtree;
pub mod error;
pub mod filetree;
pub mod hash;
pub mod index;
pub mod materialize;
pub mod merge;
pub mod mmr;
pub mod names;
pub mod path;
pub mod refs;
pub mod repo;
pub mod serialize;
pub mod shelf;
pub mod time;

mod io;
mod lockfile;
mod odb;

pub use odb::{LooseOdb, Odb};
