use core::fmt;

/// Number of bytes shown around a location of interest in diagnostics.
pub const WINDOW_LEN: usize = 16;

/// Formats bytes as hex, in groups of 8 separated by two spaces.
pub struct HexSlice<T>(pub T)
where
    T: AsRef<[u8]>;

impl<T: AsRef<[u8]>> fmt::Debug for HexSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.as_ref().iter().enumerate() {
            if i != 0 {
                f.write_str(if i % 8 == 0 { "  " } else { " " })?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl<T: AsRef<[u8]>> fmt::Display for HexSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Returns up to `WINDOW_LEN` bytes of `buf` starting at `offset`.
pub fn window(buf: &[u8], offset: usize) -> &[u8] {
    let start = offset.min(buf.len());
    let end = start.saturating_add(WINDOW_LEN).min(buf.len());
    &buf[start..end]
}
