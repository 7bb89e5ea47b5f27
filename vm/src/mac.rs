use sha2::{Digest, Sha256};

/// QEMU's locally administered OUI.
const QEMU_OUI: [u8; 3] = [0x52, 0x54, 0x00];

/// A MAC address derived from the instance id, stable for the instance lifetime.
pub fn mac_address_for(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    let [a, b, c] = QEMU_OUI;
    format!(
        "{a:02x}:{b:02x}:{c:02x}:{:02x}:{:02x}:{:02x}",
        digest[0], digest[1], digest[2]
    )
}
