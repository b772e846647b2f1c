use crate::Record;
use sha2::{Digest, Sha256};
use std::cell::RefCell;

/// Track the state of the runtime for determinism auditing.
///
/// Every journal record, random draw, and metric registration is folded into a running
/// SHA-256 digest. Two runs that interleave identically end with the same [Auditor::state].
#[derive(Debug, Default)]
pub struct Auditor {
    hash: RefCell<Vec<u8>>,
}

impl Auditor {
    fn update(&self, tag: &[u8], fill: impl FnOnce(&mut Sha256)) {
        let mut hash = self.hash.borrow_mut();
        let mut hasher = Sha256::new();
        hasher.update(&*hash);
        hasher.update(tag);
        fill(&mut hasher);
        *hash = hasher.finalize().to_vec();
    }

    pub(crate) fn record(&self, record: &Record) {
        self.update(b"record", |hasher| {
            hasher.update(record.time.as_nanos().to_be_bytes());
            match record.thread {
                Some(id) => hasher.update(id.get().to_be_bytes()),
                None => hasher.update(b"dispatcher"),
            }
            hasher.update(record.kind.name().as_bytes());
            hasher.update(record.detail.as_bytes());
        });
    }

    pub(crate) fn rand(&self, method: &str) {
        self.update(b"rand", |hasher| hasher.update(method.as_bytes()));
    }

    pub(crate) fn register(&self, name: &str, help: &str) {
        self.update(b"register", |hasher| {
            hasher.update(name.as_bytes());
            hasher.update(help.as_bytes());
        });
    }

    /// Generate a representation of the current state of the runtime.
    ///
    /// This can be used to ensure that logic running on top
    /// of the runtime is interacting deterministically.
    pub fn state(&self) -> String {
        hex(&self.hash.borrow())
    }
}

/// Encode bytes as a lowercase hexadecimal string.
fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut encoded = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(encoded, "{byte:02x}");
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Kind, ThreadId};
    use std::time::Duration;

    fn record(detail: &str) -> Record {
        Record {
            time: Duration::from_secs(1),
            thread: Some(ThreadId::new(0)),
            kind: Kind::Wake,
            detail: detail.to_string(),
        }
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[]), "");
        assert_eq!(hex(&[0x00, 0x0f, 0xab, 0xff]), "000fabff");
    }

    #[test]
    fn test_same_history_same_state() {
        let a = Auditor::default();
        let b = Auditor::default();
        assert_eq!(a.state(), "");
        for auditor in [&a, &b] {
            auditor.record(&record("x"));
            auditor.rand("next_u64");
        }
        assert_eq!(a.state(), b.state());
        assert_eq!(a.state().len(), 64);
    }

    #[test]
    fn test_different_history_different_state() {
        let a = Auditor::default();
        let b = Auditor::default();
        a.record(&record("x"));
        b.record(&record("y"));
        assert_ne!(a.state(), b.state());

        let c = Auditor::default();
        c.record(&record("x"));
        c.register("packets", "help");
        assert_ne!(a.state(), c.state());
    }
}
