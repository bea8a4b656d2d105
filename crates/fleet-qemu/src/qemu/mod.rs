//! Everything needed to turn a machine request into a QEMU process.

mod board;
mod builder;
mod disk;
mod swtpm;

pub use board::{BoardProfile, board_profile, host_board_profile};
pub use builder::QemuBuilder;
pub use disk::{DiskError, PreparedDisk, pass_to_child, prepare_disk, validate_disks};
pub use swtpm::Swtpm;
