#![cfg_attr(
	not(doc),
	expect(missing_docs, reason = "docs are enabled only under `doc` cfg")
)]
#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod device;
pub mod umem;

use log::warn;
use ptedit::{Config, Error, Implementation, Result, Session, access::Direct};

use self::{
	device::DeviceChannel,
	umem::{FileAccess, MappedWindow},
};

/// Opens a session on the device `config` names.
///
/// The physical memory device is registered for page I/O whenever it
/// can be opened; it is only required by [`Implementation::UserPread`]
/// and [`Implementation::User`]. [`Implementation::User`] additionally
/// maps `window_len` bytes of it.
pub fn open(config: &Config) -> Result<Session<'static, DeviceChannel>> {
	let channel = DeviceChannel::open(&config.device_path)?;
	let mut session = Session::open(channel, config)?;
	let page_size = session.page_size();

	match FileAccess::open(&config.umem_path, page_size) {
		Ok(access) => session = session.with_pread_access(access),
		Err(err)
			if matches!(
				config.implementation,
				Implementation::Kernel | Implementation::Mediated
			) =>
		{
			warn!(
				"{} unavailable, page I/O goes through the device: {err}",
				config.umem_path.display()
			);
		}
		Err(err) => return Err(err),
	}

	if config.implementation == Implementation::User {
		let len = usize::try_from(config.window_len)
			.map_err(|_| Error::Unsupported(format!("window length {:#x}", config.window_len)))?;
		let window = MappedWindow::open(&config.umem_path, len)?;
		session = session.with_direct_access(Direct::new(window, page_size));
	}

	session.use_implementation(config.implementation)?;
	Ok(session)
}
