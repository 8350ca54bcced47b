/*
    A single-decree Synod protocol run by N participants that talk only by
    asynchronous messages. Each participant proposes, gathers a majority of
    promises, imposes the highest previously accepted value (or its own),
    and decides once a majority acknowledges. Up to f participants may stop
    responding; an externally elected leader suppresses competing proposers
    so that dueling ballots cannot abort each other forever.
*/

pub mod common;
pub mod consensus;
pub mod driver;
pub mod error;
pub mod network;

pub use error::{Error, Result};
