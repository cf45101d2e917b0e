//! Concrete node implementations for the five representative stage
//! kinds (spec §4), plus two ancillary nodes this crate needs to make
//! them usable: [`vec_source`] (a finite in-memory source for seeding
//! scenarios and tests) and the coupling inlet/outlet pair used to
//! stitch a region-sealed subgraph onto another one built later.

pub mod coupling;
pub mod fanout;
pub mod flatten_concat;
pub mod map;
pub mod prefix_and_tail;
pub mod push_source;
pub mod vec_source;

pub use coupling::{coupling, CouplingInlet, CouplingOutlet};
pub use fanout::FanOutRoundRobin;
pub use flatten_concat::{FlattenConcat, SubSource};
pub use map::Map;
pub use prefix_and_tail::{PrefixAndTail, PrefixTailPair, TailSubSource};
pub use push_source::{push_source, PushSource, PushSourceHandle};
pub use vec_source::VecSource;
