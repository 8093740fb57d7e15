//! AArch64 translation table descriptors and `MAIR_EL1`.

mod descriptor;
pub mod mair;

pub use self::{
	descriptor::{Descriptor, DescriptorKind, bit},
	mair::{AttributesType, Cacheability, MairAttributes, MairDeviceAttribute, MairRegister},
};
