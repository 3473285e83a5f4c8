//! Identity of a running role, recorded on the jobs it claims.

use rand::Rng;
use serde::Serialize;
use std::fmt;

/// Who is holding a claimed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessIdentity {
    pub kind: &'static str,
    pub hostname: String,
    pub pid: u32,
    /// Distinguishes several roles of the same kind in one process
    pub nonce: String,
}

impl ProcessIdentity {
    pub fn new(kind: &'static str) -> Self {
        let nonce: u32 = rand::rng().random();
        Self {
            kind,
            hostname: hostname(),
            pid: std::process::id(),
            nonce: format!("{:08x}", nonce),
        }
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}-{}", self.kind, self.hostname, self.pid, self.nonce)
    }
}

#[cfg(unix)]
fn hostname() -> String {
    let mut buffer = [0u8; 256];
    // SAFETY: the buffer is valid for `buffer.len()` bytes and gethostname
    // writes at most that many.
    let rc = unsafe { libc::gethostname(buffer.as_mut_ptr().cast(), buffer.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..end]).into_owned()
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identities_are_distinct() {
        let a = ProcessIdentity::new("worker");
        let b = ProcessIdentity::new("worker");

        assert_eq!(a.pid, std::process::id());
        assert!(!a.hostname.is_empty());
        assert_ne!(a.to_string(), b.to_string());
        assert!(a.to_string().starts_with("worker-"));
    }
}
