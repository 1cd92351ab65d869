//! Request fixtures shared by the integration tests.

use serde_json::{json, Value};

pub const KEY_A: &str = "tenant-a-key-0123456789abcdef";
pub const KEY_B: &str = "tenant-b-key-0123456789abcdef";

/// Enough of a PNG header for format sniffing.
pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\x05\0\0\0\x02\xd0";

/// Hostnames the test resolver knows, all mapped to public addresses.
pub const PUBLIC_HOSTS: &[(&str, &str)] = &[
    ("images.example.com", "93.184.216.34"),
    ("hooks.example.com", "93.184.216.35"),
];

/// A request that passes validation, using a file under the image root.
pub fn generate_body() -> Value {
    json!({
        "prompt": "a cat slowly turning its head toward the camera",
        "image": "cat.png",
        "webhook_url": "https://hooks.example.com/videogen"
    })
}

pub fn with(mut body: Value, key: &str, value: Value) -> Value {
    body[key] = value;
    body
}
