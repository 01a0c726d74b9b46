// ============================================================================
// IMAGE COMPOSITOR (CPU) — value plane → RGBA8 through a palette
// ============================================================================

use rayon::prelude::*;

use crate::model::{Palette, Rgba};

/// Pixels per rayon task when compositing.
const COMPOSITE_CHUNK: usize = 16 * 1024;

/// Look every value up in `palette`, clamping to its last entry.
/// No interpolation and no gamma: the palette bytes are copied verbatim.
/// An empty palette behaves like the 256-level grey ramp.
pub fn composite(values: &[u8], palette: &[Rgba]) -> Vec<u8> {
    if palette.is_empty() {
        return composite(values, Palette::grayscale().entries());
    }
    let last = palette.len() - 1;
    let mut out = vec![0u8; values.len() * 4];
    out.par_chunks_mut(COMPOSITE_CHUNK * 4)
        .zip(values.par_chunks(COMPOSITE_CHUNK))
        .for_each(|(dst, src)| {
            for (px, &v) in dst.chunks_exact_mut(4).zip(src) {
                px.copy_from_slice(&palette[(v as usize).min(last)].to_bytes());
            }
        });
    out
}

/// Pixels read back from the GPU (one little-endian RGBA u32 each) as RGBA8 bytes.
pub fn unpack_pixels(packed: &[u32]) -> Vec<u8> {
    bytemuck::cast_slice::<u32, u8>(packed).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_past_short_palette_clamps_to_last_entry() {
        let palette = [Rgba::rgb(255, 0, 0), Rgba::rgb(0, 255, 0), Rgba::rgb(0, 0, 255)];
        assert_eq!(composite(&[200], &palette), vec![0, 0, 255, 255]);
        assert_eq!(composite(&[1], &palette), vec![0, 255, 0, 255]);
    }

    #[test]
    fn bytes_are_copied_verbatim() {
        let palette = Palette::from_entries(vec![Rgba::new(10, 20, 30, 40), Rgba::new(1, 2, 3, 4)]);
        let out = composite(&[0, 1, 255], palette.entries());
        assert_eq!(out, vec![10, 20, 30, 40, 1, 2, 3, 4, 1, 2, 3, 4]);
    }

    #[test]
    fn empty_palette_is_grey() {
        assert_eq!(composite(&[7], &[]), vec![7, 7, 7, 255]);
    }

    #[test]
    fn large_buffers_cross_chunk_boundaries() {
        let values: Vec<u8> = (0..COMPOSITE_CHUNK * 2 + 5).map(|i| (i % 256) as u8).collect();
        let out = composite(&values, Palette::grayscale().entries());
        assert_eq!(out.len(), values.len() * 4);
        let last = values.len() - 1;
        assert_eq!(out[last * 4], values[last]);
    }

    #[test]
    fn unpack_reads_the_device_word_layout() {
        assert_eq!(unpack_pixels(&[0x0403_0201, 0xFDFC_FBFA]), vec![1, 2, 3, 4, 250, 251, 252, 253]);
        // The palette is uploaded in the same layout the kernel writes back.
        let palette = Palette::from_entries(vec![Rgba::new(10, 20, 30, 40)]);
        assert_eq!(&unpack_pixels(&palette.packed())[..4], &[10, 20, 30, 40]);
    }
}
