use std::path::{Path, PathBuf};

use accord_core::config::accord_dir_at;

pub const DAEMON_SOCKET: &str = "accord.sock";

/// `<root>/.accord/accord.sock`
pub fn socket_path(root: &Path) -> PathBuf {
    accord_dir_at(root).join(DAEMON_SOCKET)
}
