//! # Status Endpoint
//!
//! Read-only signature identifying the running build.

use alloc::format;
use alloc::string::String;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build stamp, injected by the build environment when available
pub const BUILD: &str = match option_env!("HELIX_BUILD_TIMESTAMP") {
    Some(stamp) => stamp,
    None => "unknown",
};

/// Three-line signature: version, target and build
pub fn signature(target: &str) -> String {
    format!("version: {}\ntarget: {}\nbuild: {}\n", VERSION, target, BUILD)
}

/// Read `signature` at file position `pos`
///
/// Returns the number of bytes copied: short at the end, zero past it.
pub fn read_at(signature: &str, pos: u64, buf: &mut [u8]) -> usize {
    let bytes = signature.as_bytes();
    let Ok(start) = usize::try_from(pos) else {
        return 0;
    };
    if start >= bytes.len() {
        return 0;
    }
    let len = buf.len().min(bytes.len() - start);
    buf[..len].copy_from_slice(&bytes[start..start + len]);
    len
}
