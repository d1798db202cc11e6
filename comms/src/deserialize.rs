use std::io;

/// Reads a value back from a complete frame body.
pub trait Deserialize<'a>: Sized {
    /// Parses `buf` into a new value.
    ///
    /// # Returns
    /// The parsed value or an `InvalidData` io error.
    fn deserialize(buf: &'a [u8]) -> io::Result<Self>;
}
