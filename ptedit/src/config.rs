//! Session configuration.
//!
//! Defaults match a stock installation of the kernel module. Any field
//! may be overridden through the environment:
//!
//! | Variable            | Field            |
//! |---------------------|------------------|
//! | `PTEDIT_DEVICE`     | `device_path`    |
//! | `PTEDIT_UMEM`       | `umem_path`      |
//! | `PTEDIT_IMPL`       | `implementation` |
//! | `PTEDIT_PAGING`     | `paging`         |
//! | `PTEDIT_WINDOW_LEN` | `window_len`     |

use std::path::PathBuf;

use ptedit_arch::{Architecture, Geometry, PagingMode};

use crate::{Error, Result, session::Implementation};

/// Where the privileged device lives and how walks are carried out.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
	/// The privileged command device.
	pub device_path:    PathBuf,
	/// The physical memory device used by the user-space paths.
	pub umem_path:      PathBuf,
	/// How resolve and update are carried out.
	pub implementation: Implementation,
	/// The paging mode; the host's default when `None`.
	pub paging:         Option<PagingMode>,
	/// Bytes of physical memory mapped for [`Implementation::User`].
	pub window_len:     u64,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			device_path:    PathBuf::from("/dev/pteditor"),
			umem_path:      PathBuf::from("/proc/umem"),
			implementation: Implementation::Kernel,
			paging:         None,
			window_len:     32 << 30,
		}
	}
}

impl Config {
	/// The defaults overlaid with the process environment.
	pub fn from_env() -> Result<Self> {
		Self::from_lookup(|name| std::env::var(name).ok())
	}

	/// The defaults overlaid with whatever `lookup` returns for each
	/// `PTEDIT_*` variable.
	pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
		let mut config = Self::default();

		if let Some(path) = lookup("PTEDIT_DEVICE") {
			config.device_path = path.into();
		}

		if let Some(path) = lookup("PTEDIT_UMEM") {
			config.umem_path = path.into();
		}

		if let Some(name) = lookup("PTEDIT_IMPL") {
			config.implementation = name
				.parse()
				.map_err(|_| Error::Unsupported(format!("implementation {name:?}")))?;
		}

		if let Some(name) = lookup("PTEDIT_PAGING") {
			config.paging = Some(
				name.parse()
					.map_err(|_| Error::Unsupported(format!("paging mode {name:?}")))?,
			);
		}

		if let Some(len) = lookup("PTEDIT_WINDOW_LEN") {
			config.window_len = parse_len(&len)
				.ok_or_else(|| Error::Unsupported(format!("window length {len:?}")))?;
		}

		Ok(config)
	}

	/// The geometry to walk with: the configured paging mode, or the
	/// host architecture's default.
	pub fn geometry(&self) -> Result<Geometry> {
		match self.paging {
			Some(mode) => Ok(Geometry::new(mode)),
			None => {
				Architecture::host()
					.map(Geometry::for_arch)
					.ok_or_else(|| Error::Unsupported(std::env::consts::ARCH.to_owned()))
			}
		}
	}
}

/// Parses a decimal or `0x`-prefixed hexadecimal byte count.
fn parse_len(text: &str) -> Option<u64> {
	let text = text.trim();
	match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
		Some(hex) => u64::from_str_radix(hex, 16).ok(),
		None => text.parse().ok(),
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;

	use super::*;

	fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let vars: BTreeMap<String, String> = vars
			.iter()
			.map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
			.collect();
		move |name| vars.get(name).cloned()
	}

	#[test]
	fn defaults() {
		let config = Config::from_lookup(|_| None).unwrap();
		assert_eq!(config, Config::default());
		assert_eq!(config.device_path, PathBuf::from("/dev/pteditor"));
		assert_eq!(config.implementation, Implementation::Kernel);
		assert_eq!(config.window_len, 0x8_0000_0000);
	}

	#[test]
	fn environment_overrides() {
		let config = Config::from_lookup(lookup(&[
			("PTEDIT_DEVICE", "/tmp/dev"),
			("PTEDIT_IMPL", "user-pread"),
			("PTEDIT_PAGING", "aarch64-va48"),
			("PTEDIT_WINDOW_LEN", "0x1000"),
		]))
		.unwrap();

		assert_eq!(config.device_path, PathBuf::from("/tmp/dev"));
		assert_eq!(config.umem_path, PathBuf::from("/proc/umem"));
		assert_eq!(config.implementation, Implementation::UserPread);
		assert_eq!(config.paging, Some(PagingMode::Aarch64Va48));
		assert_eq!(config.window_len, 0x1000);
		assert_eq!(
			config.geometry().unwrap().mode(),
			PagingMode::Aarch64Va48
		);
	}

	#[test]
	fn unknown_values_are_unsupported() {
		for vars in [
			[("PTEDIT_IMPL", "hypervisor")],
			[("PTEDIT_PAGING", "riscv-sv39")],
			[("PTEDIT_WINDOW_LEN", "lots")],
		] {
			assert!(matches!(
				Config::from_lookup(lookup(&vars)),
				Err(Error::Unsupported(_))
			));
		}
	}

	#[test]
	fn deserializes_partial_documents() {
		let config: Config = serde_json::from_str(
			r#"{ "implementation": "user", "paging": "x86_64-l5", "window_len": 4096 }"#,
		)
		.unwrap();
		assert_eq!(config.implementation, Implementation::User);
		assert_eq!(config.paging, Some(PagingMode::X86_64Level5));
		assert_eq!(config.umem_path, PathBuf::from("/proc/umem"));

		assert!(serde_json::from_str::<Config>(r#"{ "colour": "blue" }"#).is_err());
		assert!(serde_json::from_str::<Config>(r#"{ "implementation": "fast" }"#).is_err());
	}
}
