//! Copies across the caller boundary.
//!
//! The device never touches caller memory directly. The dispatch layer hands
//! it a `UserSource` (for write) or a `UserDest` (for read), already
//! validated, and the device moves bytes through them.
//!
//! Both copy functions follow the `copy_{from,to}_user` convention: the
//! return value is the number of bytes that could NOT be transferred, so
//! zero means success.

/// Caller-owned bytes the device copies in from.
pub trait UserSource {
    /// Bytes available at the caller address. Checked before the copy so
    /// a short source fails without touching the device.
    fn user_len(&self) -> usize;

    /// Fill `dst` from the start of the caller region.
    ///
    /// Returns the residual: bytes of `dst` that were not filled.
    fn copy_from_user(&self, dst: &mut [u8]) -> usize;
}

/// Caller-owned memory the device copies out to.
pub trait UserDest {
    /// Copy `src` to the start of the caller region.
    ///
    /// Returns the residual: bytes of `src` that were not transferred.
    fn copy_to_user(&mut self, src: &[u8]) -> usize;
}

impl UserSource for [u8] {
    fn user_len(&self) -> usize {
        self.len()
    }

    fn copy_from_user(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len());
        dst[..n].copy_from_slice(&self[..n]);
        dst.len() - n
    }
}

impl UserSource for Vec<u8> {
    fn user_len(&self) -> usize {
        self.len()
    }

    fn copy_from_user(&self, dst: &mut [u8]) -> usize {
        self.as_slice().copy_from_user(dst)
    }
}

impl UserDest for [u8] {
    fn copy_to_user(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.len());
        self[..n].copy_from_slice(&src[..n]);
        src.len() - n
    }
}

impl UserDest for Vec<u8> {
    fn copy_to_user(&mut self, src: &[u8]) -> usize {
        self.as_mut_slice().copy_to_user(src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_from_short_source() {
        let src = b"abc";
        let mut dst = [0u8; 5];
        let residual = src[..].copy_from_user(&mut dst);
        assert_eq!(residual, 2);
        assert_eq!(&dst[..3], b"abc");
    }

    #[test]
    fn test_copy_to_short_dest() {
        let mut dst = [0u8; 2];
        let residual = dst[..].copy_to_user(b"hello");
        assert_eq!(residual, 3);
        assert_eq!(&dst, b"he");
    }

    #[test]
    fn test_full_copy_has_no_residual() {
        let mut dst = vec![0u8; 5];
        assert_eq!(dst.copy_to_user(b"hello"), 0);
        assert_eq!(dst, b"hello");
    }
}
