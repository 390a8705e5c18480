//! Growable argument vector with a length-prefixed marshalled wire form.
//!
//! Mirrors the `vec_t` helper used by the client/daemon to build `execve`
//! argument arrays and to serialize flag/value pairs for `GENERIC_COMMAND`.

/// An ordered sequence of strings destined either for `execve` (via
/// [`ArgVec::data`], which appends a NULL terminator) or for the wire (via
/// [`ArgVec::marshal`]).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ArgVec {
    items: Vec<String>,
    finalized: bool,
}

impl ArgVec {
    /// Create a vector with room for `capacity` elements before the first
    /// reallocation. Capacity is a hint only.
    pub fn init(capacity: usize) -> Self {
        ArgVec {
            items: Vec::with_capacity(capacity),
            finalized: false,
        }
    }

    /// Append one element. Appending after `finalize` un-finalizes the
    /// vector; `data()` will require another `finalize()` call.
    pub fn append<S: Into<String>>(&mut self, s: S) {
        self.items.push(s.into());
        self.finalized = false;
    }

    /// Mark the vector as terminator-ready. `data()` panics if called on a
    /// vector that has been appended to since the last `finalize()`.
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    /// Number of elements, excluding the terminator.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Borrow the elements in order. Requires `finalize()` to have been
    /// called since the last `append()`, matching the source invariant that
    /// `data()` never returns a partially-finalized vector.
    pub fn data(&self) -> &[String] {
        assert!(
            self.finalized,
            "ArgVec::data called on a non-finalized vector"
        );
        &self.items
    }

    /// Build a `Vec<CString>` suitable for handing to
    /// `tokio::process::Command::args`-style execve plumbing. Terminator is
    /// implicit in argv arrays built this way, so this simply requires
    /// finalize() to have been called, matching the invariant above.
    pub fn to_exec_args(&self) -> Vec<String> {
        assert!(
            self.finalized,
            "ArgVec::to_exec_args called on a non-finalized vector"
        );
        self.items.clone()
    }

    /// Join all elements with `sep`.
    pub fn join(&self, sep: &str) -> String {
        self.items.join(sep)
    }

    /// Marshal into a self-describing buffer: a 4-byte element count,
    /// followed by, per element, a 4-byte length prefix and the raw bytes.
    /// This is the payload body for `GENERIC_COMMAND`.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.items.len() as u32).to_ne_bytes());
        for item in &self.items {
            let bytes = item.as_bytes();
            buf.extend_from_slice(&(bytes.len() as u32).to_ne_bytes());
            buf.extend_from_slice(bytes);
        }
        buf
    }

    /// Inverse of [`ArgVec::marshal`]. Returns `None` if `buf` is truncated
    /// or malformed.
    pub fn unmarshal(buf: &[u8]) -> Option<ArgVec> {
        if buf.len() < 4 {
            return None;
        }
        let count = u32::from_ne_bytes(buf[0..4].try_into().ok()?) as usize;
        let mut offset = 4;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.len() < offset + 4 {
                return None;
            }
            let len = u32::from_ne_bytes(buf[offset..offset + 4].try_into().ok()?) as usize;
            offset += 4;
            if buf.len() < offset + len {
                return None;
            }
            let s = String::from_utf8(buf[offset..offset + len].to_vec()).ok()?;
            offset += len;
            items.push(s);
        }
        Some(ArgVec {
            items,
            finalized: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_finalize() {
        let mut v = ArgVec::init(4);
        v.append("stage_launch.sh");
        v.append("/cellblock");
        v.finalize();
        assert_eq!(v.data(), &["stage_launch.sh", "/cellblock"]);
    }

    #[test]
    #[should_panic]
    fn data_panics_if_not_finalized() {
        let mut v = ArgVec::init(1);
        v.append("x");
        let _ = v.data();
    }

    #[test]
    fn marshal_round_trip() {
        let mut v = ArgVec::init(3);
        v.append("-o");
        v.append("create");
        v.append("-n");
        v.finalize();

        let bytes = v.marshal();
        let back = ArgVec::unmarshal(&bytes).expect("unmarshal");
        assert_eq!(back, v);
    }

    #[test]
    fn unmarshal_rejects_truncated() {
        let mut v = ArgVec::init(1);
        v.append("hello");
        v.finalize();
        let mut bytes = v.marshal();
        bytes.truncate(bytes.len() - 2);
        assert!(ArgVec::unmarshal(&bytes).is_none());
    }

    #[test]
    fn join() {
        let mut v = ArgVec::init(2);
        v.append("a");
        v.append("b");
        v.finalize();
        assert_eq!(v.join(","), "a,b");
    }
}
