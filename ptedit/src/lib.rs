#![cfg_attr(
	not(doc),
	expect(missing_docs, reason = "docs are enabled only under `doc` cfg")
)]
#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod access;
pub mod channel;
pub mod config;
pub mod gate;
pub mod ladder;
pub mod session;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod tlb;
pub mod walk;

mod error;

pub use self::{
	config::Config,
	error::{Error, Result},
	ladder::Ladder,
	session::{Implementation, Session},
};
