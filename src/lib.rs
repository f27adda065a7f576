/// Process-level plumbing shared by all netprobe binaries.
pub mod helpers;
