//! Optional compressed page image.
//!
//! A compressed tablespace keeps, next to every uncompressed frame, a
//! Snappy image bounded by a fixed capacity. Compression fails when the
//! encoded page no longer fits that capacity; callers must then run
//! their documented fallback (restore the pre-image, or copy byte for
//! byte and delete the opposite side).

use snap::raw::{Decoder, Encoder};

/// Compressed image of one page frame.
#[derive(Clone)]
pub struct ZipFrame {
    cap: usize,
    data: Vec<u8>,
}

impl ZipFrame {
    /// An empty image with the given capacity.
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            data: Vec::new(),
        }
    }

    /// Capacity in bytes.
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// The last successfully compressed image.
    pub fn image(&self) -> &[u8] {
        &self.data
    }

    /// Compresses `frame` into the image. On failure the previous image
    /// is kept and `false` is returned.
    pub fn compress(&mut self, frame: &[u8]) -> bool {
        let encoded = match Encoder::new().compress_vec(frame) {
            Ok(encoded) => encoded,
            Err(_) => return false,
        };
        if encoded.len() > self.cap {
            return false;
        }
        self.data = encoded;
        true
    }

    /// Decompresses the image back to frame bytes.
    pub fn decompress(&self) -> Option<Vec<u8>> {
        Decoder::new().decompress_vec(&self.data).ok()
    }

    /// Byte-for-byte image copy from `other`. Capacities must match.
    pub fn copy_from(&mut self, other: &ZipFrame) {
        debug_assert_eq!(self.cap, other.cap);
        self.data = other.data.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_when_it_fits() {
        let frame = vec![0u8; 4096];
        let mut zip = ZipFrame::new(1024);
        assert!(zip.compress(&frame));
        assert_eq!(zip.decompress().unwrap(), frame);
    }

    #[test]
    fn incompressible_data_fails_and_keeps_the_old_image() {
        let mut zip = ZipFrame::new(64);
        let zeros = vec![0u8; 512];
        assert!(zip.compress(&zeros));
        let old = zip.image().to_vec();
        let noisy: Vec<u8> = (0..512u32).map(|i| (i.wrapping_mul(2654435761)) as u8).collect();
        assert!(!zip.compress(&noisy));
        assert_eq!(zip.image(), old.as_slice());
    }
}
