#![cfg_attr(
	not(doc),
	expect(missing_docs, reason = "docs are enabled only under `doc` cfg")
)]
#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod aarch64;
pub mod entry;
pub mod geometry;
pub mod level;
pub mod memtype;
pub mod render;
pub mod x86_64;

mod error;

pub use self::{
	entry::{Codec, Entry},
	error::{Error, Result},
	geometry::{Geometry, LevelSpec, PagingMode},
	level::{Level, LevelMask},
	memtype::MemTypeTable,
	render::EntryTable,
};

/// The CPU families whose translation tables can be edited.
#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Hash,
	strum::Display,
	strum::EnumString,
	strum::EnumIter,
	serde::Serialize,
	serde::Deserialize,
)]
pub enum Architecture {
	/// 64-bit x86 (`x86_64`, `amd64`).
	#[strum(to_string = "x86_64", serialize = "amd64")]
	#[serde(rename = "x86_64", alias = "amd64")]
	X86_64,
	/// 64-bit ARM (`aarch64`, `arm64`).
	#[strum(to_string = "aarch64", serialize = "arm64")]
	#[serde(rename = "aarch64", alias = "arm64")]
	Aarch64,
}

impl Architecture {
	/// Returns the architecture this crate was compiled for,
	/// or `None` if the host is neither `x86_64` nor `aarch64`.
	#[must_use]
	pub const fn host() -> Option<Self> {
		if cfg!(target_arch = "x86_64") {
			Some(Self::X86_64)
		} else if cfg!(target_arch = "aarch64") {
			Some(Self::Aarch64)
		} else {
			None
		}
	}

	/// Parses an architecture name.
	pub fn parse(name: &str) -> Result<Self> {
		name.parse::<Self>()
			.map_err(|_| Error::UnsupportedArchitecture(name.to_owned()))
	}

	/// The paging mode assumed when none is configured.
	#[must_use]
	pub const fn default_paging_mode(self) -> PagingMode {
		match self {
			Self::X86_64 => PagingMode::X86_64Level4,
			Self::Aarch64 => PagingMode::Aarch64Va39,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_known_names() {
		assert_eq!(Architecture::parse("x86_64").unwrap(), Architecture::X86_64);
		assert_eq!(Architecture::parse("amd64").unwrap(), Architecture::X86_64);
		assert_eq!(Architecture::parse("aarch64").unwrap(), Architecture::Aarch64);
		assert_eq!(Architecture::parse("arm64").unwrap(), Architecture::Aarch64);
		assert_eq!(Architecture::X86_64.to_string(), "x86_64");
		assert_eq!(Architecture::Aarch64.to_string(), "aarch64");
	}

	#[test]
	fn rejects_unknown_names() {
		let err = Architecture::parse("riscv64").unwrap_err();
		assert!(matches!(err, Error::UnsupportedArchitecture(ref name) if name == "riscv64"));
	}

	#[test]
	fn deserializes_aliases() {
		let arch: Architecture = serde_json::from_str("\"arm64\"").unwrap();
		assert_eq!(arch, Architecture::Aarch64);
	}
}
