use std::io;

/// Lays a value out as a complete wire frame.
pub trait Serialize<'a> {
    /// Appends the head of the frame into `buf`, that is the big endian length prefix followed
    /// by every owned byte of the body.
    ///
    /// # Arguments
    /// * `buf` - The frame buffer, it may already contain bytes that must be kept.
    ///
    /// # Returns
    /// An optional borrowed tail that must be written right after the head, the length prefix
    /// already accounts for it.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}
