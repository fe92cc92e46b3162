use core::fmt;

/// Keys longer than this are cut off when printed.
const MAX_SHOWN: usize = 16;

pub struct HexSlice<'a>(&'a [u8]);

impl<'a> HexSlice<'a> {
    fn new<T>(data: &'a T) -> HexSlice<'a>
    where
        T: ?Sized + AsRef<[u8]> + 'a,
    {
        HexSlice(data.as_ref())
    }
}

impl fmt::Display for HexSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().take(MAX_SHOWN) {
            write!(f, "{:02x}", byte)?;
        }
        if self.0.len() > MAX_SHOWN {
            write!(f, "..(+{}B)", self.0.len() - MAX_SHOWN)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Renders byte strings (keys, mostly) as lowercase hex in log lines.
pub trait HexDisplayExt {
    fn hex(&self) -> HexSlice<'_>;
}

impl<T> HexDisplayExt for T
where
    T: ?Sized + AsRef<[u8]>,
{
    fn hex(&self) -> HexSlice<'_> {
        HexSlice::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::HexDisplayExt;

    #[test]
    fn short_keys_print_in_full() {
        assert_eq!(b"\x01\xab".hex().to_string(), "01ab");
        assert_eq!(b"".hex().to_string(), "");
    }

    #[test]
    fn long_keys_are_truncated() {
        let key = [0xffu8; 20];
        let shown = format!("{}..(+4B)", "ff".repeat(16));
        assert_eq!(key.hex().to_string(), shown);
    }
}
