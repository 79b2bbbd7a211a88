pub mod error;
pub mod object_store;
pub mod process;
pub mod tunnel;

pub use error::{Result, StoreError};
pub use object_store::{is_metadata_object, ObjectStore, STAMP_TAG_KEY};
pub use process::{find_free_port, ManagedProcess};
pub use tunnel::{Tunnel, TunnelConfig};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_objects_are_recognized_by_filename() {
        assert!(is_metadata_object("builds/39/meta.json"));
        assert!(is_metadata_object("builds.json"));
        assert!(is_metadata_object("ostree-commit-object"));
        assert!(!is_metadata_object("builds/39/fedora-coreos.qcow2"));
    }

    #[test]
    fn find_free_port_returns_a_port_in_range() {
        let port = find_free_port().unwrap();
        assert!(port >= 9000);
    }
}
