//! Bit-table rendering of a single translation entry.

use core::fmt;

use crate::{Architecture, Codec};

/// What a column of the table shows.
#[derive(Clone, Copy)]
enum Cell {
	/// A single bit.
	Bit(u32),
	/// A multi-bit field: lowest bit and width.
	Field(u32, u32),
	/// The page-frame number field.
	Pfn,
}

/// Width of the PFN column title, wide enough for a 40-bit hex value.
const PFN_TITLE: &str = "       PFN        ";

/// Columns of an x86_64 entry, most significant first.
const X86_64_COLUMNS: &[(&str, Cell)] = &[
	("NX", Cell::Bit(63)),
	(PFN_TITLE, Cell::Pfn),
	("H", Cell::Bit(12)),
	("?", Cell::Bit(11)),
	("?", Cell::Bit(10)),
	("?", Cell::Bit(9)),
	("G", Cell::Bit(8)),
	("S", Cell::Bit(7)),
	("D", Cell::Bit(6)),
	("A", Cell::Bit(5)),
	("UC", Cell::Bit(4)),
	("WT", Cell::Bit(3)),
	("U", Cell::Bit(2)),
	("W", Cell::Bit(1)),
	("P", Cell::Bit(0)),
];

/// Columns of an AArch64 descriptor, most significant first.
const AARCH64_COLUMNS: &[(&str, Cell)] = &[
	("XN", Cell::Bit(54)),
	("PXN", Cell::Bit(53)),
	("C", Cell::Bit(52)),
	(PFN_TITLE, Cell::Pfn),
	("nG", Cell::Bit(11)),
	("AF", Cell::Bit(10)),
	("SH", Cell::Field(8, 2)),
	("AP", Cell::Field(6, 2)),
	("NS", Cell::Bit(5)),
	("AI", Cell::Field(2, 3)),
	("T", Cell::Bit(1)),
	("V", Cell::Bit(0)),
];

/// Renders a raw entry as a four-line bit table:
///
/// ```text
/// +--+------------------+-+-+-+-+-+-+-+-+--+--+-+-+-+
/// |NX|       PFN        |H|?|?|?|G|S|D|A|UC|WT|U|W|P|
/// | 1|          0x12345 |1|0|0|0|0|0|1|1| 0| 0|1|1|1|
/// +--+------------------+-+-+-+-+-+-+-+-+--+--+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryTable {
	/// Whose layout to render.
	arch: Architecture,
	/// The raw entry.
	raw:  u64,
}

impl EntryTable {
	/// Prepares `raw` for rendering under `arch`'s layout.
	#[must_use]
	pub const fn new(arch: Architecture, raw: u64) -> Self {
		Self { arch, raw }
	}

	/// The column layout for the architecture.
	const fn columns(&self) -> &'static [(&'static str, Cell)] {
		match self.arch {
			Architecture::X86_64 => X86_64_COLUMNS,
			Architecture::Aarch64 => AARCH64_COLUMNS,
		}
	}

	/// Writes the `+--+--+` separator line.
	fn border(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("+")?;
		for (title, _) in self.columns() {
			write!(f, "{}+", "-".repeat(title.len()))?;
		}
		f.write_str("\n")
	}
}

impl fmt::Display for EntryTable {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.border(f)?;

		f.write_str("|")?;
		for (title, _) in self.columns() {
			write!(f, "{title}|")?;
		}
		f.write_str("\n")?;

		f.write_str("|")?;
		for (title, cell) in self.columns() {
			let width = title.len();
			match *cell {
				Cell::Bit(bit) => write!(f, "{:>width$}|", (self.raw >> bit) & 1)?,
				Cell::Field(low, bits) => {
					write!(f, "{:>width$}|", (self.raw >> low) & ((1 << bits) - 1))?;
				}
				Cell::Pfn => {
					let pfn = format!("{:#x}", Codec::for_arch(self.arch).pfn(self.raw));
					let width = width - 1;
					write!(f, "{pfn:>width$} |")?;
				}
			}
		}
		f.write_str("\n")?;

		self.border(f)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn x86_64_table() {
		let table = EntryTable::new(Architecture::X86_64, 0x8000_0000_1234_5067).to_string();
		let lines: Vec<&str> = table.lines().collect();
		assert_eq!(lines.len(), 4);
		assert_eq!(lines[0], "+--+------------------+-+-+-+-+-+-+-+-+--+--+-+-+-+");
		assert_eq!(lines[1], "|NX|       PFN        |H|?|?|?|G|S|D|A|UC|WT|U|W|P|");
		assert_eq!(lines[2], "| 1|          0x12345 |1|0|0|0|0|0|1|1| 0| 0|1|1|1|");
		assert_eq!(lines[3], lines[0]);
	}

	#[test]
	fn aarch64_table() {
		let table = EntryTable::new(Architecture::Aarch64, 0x0040_0000_8000_2713).to_string();
		let lines: Vec<&str> = table.lines().collect();
		assert_eq!(lines[1], "|XN|PXN|C|       PFN        |nG|AF|SH|AP|NS|AI|T|V|");
		assert_eq!(lines[2], "| 1|  0|0|          0x80002 | 0| 1| 3| 0| 0| 4|1|1|");
		assert_eq!(lines[0].len(), lines[1].len());
	}
}
