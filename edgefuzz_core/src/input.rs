pub trait Input: Clone + Send + Sync + std::fmt::Debug + 'static {
    fn as_bytes(&self) -> &[u8];

    fn len(&self) -> usize {
        self.as_bytes().len()
    }

    fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Lowercase hex MD5 of the input bytes; the key inputs are persisted under.
    fn content_hash(&self) -> String {
        format!("{:x}", md5::compute(self.as_bytes()))
    }
}

impl Input for Vec<u8> {
    fn as_bytes(&self) -> &[u8] {
        self.as_slice()
    }
}
