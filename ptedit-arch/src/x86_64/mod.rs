//! x86_64 page table entries and the page attribute table.

mod entry;
pub mod pat;

pub use self::{
	entry::{PageTableEntry, bit},
	pat::{Pat, PatType},
};
