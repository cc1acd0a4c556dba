//! # lowloop-core - types and traits shared by every lowloop crate
//!
//! Nothing in here spawns a thread or owns an OS resource beyond the
//! descriptor bookkeeping. The runtime crate builds the three thread roles
//! (event loop, multiplexer, workers) on top of these pieces.
//!
//! ## Design principle
//!
//! > "Each object that crosses a thread boundary carries its own flags.
//! >  Whoever owns the queue owns the decision."
//!
//! - [`descriptor::Descriptor`] carries the atomics the multiplexer needs
//!   (requested interest, changed/polled/retired flags).
//! - [`queue::QueueLink`] replaces intrusive `next` pointers with a single
//!   "already queued" flag.
//! - [`slot::SlotTable`] keeps script-side values on the loop thread and
//!   hands out plain integers to everyone else.

#[macro_use]
pub mod kprint;
pub mod env;
pub mod error;
pub mod interest;
pub mod descriptor;
pub mod queue;
pub mod slot;
pub mod notifier;

pub use descriptor::{Descriptor, DescriptorKind, Pollable};
pub use error::{ErrorKind, LoopError, LoopResult};
pub use interest::Interest;
pub use notifier::Notifier;
pub use queue::QueueLink;
pub use slot::{Fetched, SlotId, SlotTable};
