//! Compact heightfield: packed open-space spans with 4-neighbour links.
//!
//! Where the solid heightfield stores occupied intervals, the compact field
//! stores the traversable space on top of each walkable span. Spans of a
//! column are contiguous in one shared array and ascend in `y`; each span
//! packs four 6-bit neighbour layer indices into a 24-bit word.

use glam::Vec3;

use crate::context::{BuildContext, ScopedTimer, StageTimer};
use crate::heightfield::{Heightfield, SPAN_NONE};
use crate::math::{self, NULL_AREA};
use crate::Result;

/// Neighbour slot value meaning "no connection".
pub const NOT_CONNECTED: u8 = 0x3f;
/// Highest layer index a 6-bit neighbour slot can address.
pub const MAX_LAYERS: i32 = NOT_CONNECTED as i32 - 1;

const MAX_HEIGHT: i32 = 0xffff;

/// One grid column of the compact field: offset and span count into the
/// shared span array. The offset carries a 24-bit budget, the count 8 bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactCell {
    pub index: u32,
    pub count: u8,
}

/// One open interval: floor `y`, clearance `h`, region id, and the packed
/// neighbour word.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactSpan {
    pub y: u16,
    pub reg: u16,
    con: u32,
    pub h: u8,
}

impl CompactSpan {
    /// Neighbour layer index in `dir`, or [`NOT_CONNECTED`].
    #[inline]
    pub fn con(&self, dir: usize) -> u8 {
        ((self.con >> (dir * 6)) & 0x3f) as u8
    }

    #[inline]
    pub fn set_con(&mut self, dir: usize, layer: u8) {
        let shift = dir * 6;
        self.con = (self.con & !(0x3f << shift)) | (((layer as u32) & 0x3f) << shift);
    }
}

/// Packed-array heightfield of open spans.
#[derive(Debug, Clone)]
pub struct CompactHeightfield {
    pub width: i32,
    pub height: i32,
    pub span_count: usize,
    pub walkable_height: i32,
    pub walkable_climb: i32,
    pub border_size: i32,
    pub max_distance: u16,
    pub max_regions: u16,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub cs: f32,
    pub ch: f32,
    pub cells: Vec<CompactCell>,
    pub spans: Vec<CompactSpan>,
    /// Chamfer distance to the nearest boundary, filled by the
    /// distance-field stage.
    pub dist: Vec<u16>,
    pub areas: Vec<u8>,
}

impl CompactHeightfield {
    #[inline]
    pub fn cell(&self, x: i32, z: i32) -> &CompactCell {
        &self.cells[(x + z * self.width) as usize]
    }

    /// Index range of the spans in column `(x, z)`.
    #[inline]
    pub fn cell_spans(&self, x: i32, z: i32) -> std::ops::Range<usize> {
        let cell = self.cell(x, z);
        let start = cell.index as usize;
        start..start + cell.count as usize
    }

    /// Global span index of the neighbour of `span` (at `(x, z)`) in `dir`.
    #[inline]
    pub fn neighbor_index(
        &self,
        x: i32,
        z: i32,
        span: &CompactSpan,
        dir: usize,
    ) -> Option<usize> {
        let layer = span.con(dir);
        if layer == NOT_CONNECTED {
            return None;
        }
        let nx = x + math::dir_offset_x(dir);
        let nz = z + math::dir_offset_z(dir);
        Some(self.cell(nx, nz).index as usize + layer as usize)
    }

    /// Builds the compact field from a filtered solid heightfield.
    pub fn build_from_heightfield(
        ctx: &mut BuildContext,
        walkable_height: i32,
        walkable_climb: i32,
        hf: &Heightfield,
    ) -> Result<Self> {
        let timer = ScopedTimer::start(ctx, StageTimer::Compact);

        let width = hf.width;
        let height = hf.height;
        let span_count = hf.walkable_span_count();

        let mut chf = CompactHeightfield {
            width,
            height,
            span_count,
            walkable_height,
            walkable_climb,
            border_size: 0,
            max_distance: 0,
            max_regions: 0,
            bmin: hf.bmin,
            // The topmost open span reaches up by the agent height.
            bmax: hf.bmax + Vec3::new(0.0, walkable_height as f32 * hf.ch, 0.0),
            cs: hf.cs,
            ch: hf.ch,
            cells: vec![CompactCell::default(); (width * height) as usize],
            spans: vec![CompactSpan::default(); span_count],
            dist: Vec::new(),
            areas: vec![NULL_AREA; span_count],
        };

        // Pass 1: lift each walkable solid span into an open span. Empty
        // columns still record the running cursor so cell indices are
        // monotone across the grid.
        let mut cursor = 0usize;
        for z in 0..height {
            for x in 0..width {
                let cell_index = (x + z * width) as usize;
                chf.cells[cell_index].index = cursor as u32;
                if hf.head(x, z) == SPAN_NONE {
                    continue;
                }
                let mut count = 0u8;
                let mut spans = hf.column(x, z).peekable();
                while let Some(span) = spans.next() {
                    if span.area == NULL_AREA {
                        continue;
                    }
                    let bot = span.smax as i32;
                    let top = spans
                        .peek()
                        .map(|next| next.smin as i32)
                        .unwrap_or(MAX_HEIGHT);
                    chf.spans[cursor].y = bot.clamp(0, MAX_HEIGHT) as u16;
                    chf.spans[cursor].h = (top - bot).clamp(0, 0xff) as u8;
                    chf.areas[cursor] = span.area;
                    cursor += 1;
                    count += 1;
                }
                chf.cells[cell_index].count = count;
            }
        }
        debug_assert_eq!(cursor, span_count);

        // Pass 2: neighbour links. A direction connects when the open
        // intervals overlap by the agent height and the floors are within
        // climbing distance.
        let mut max_layer_index = 0i32;
        for z in 0..height {
            for x in 0..width {
                for i in chf.cell_spans(x, z) {
                    let mut span = chf.spans[i];
                    for dir in 0..4 {
                        span.set_con(dir, NOT_CONNECTED);
                        let nx = x + math::dir_offset_x(dir);
                        let nz = z + math::dir_offset_z(dir);
                        if nx < 0 || nz < 0 || nx >= width || nz >= height {
                            continue;
                        }
                        let ncell_start = chf.cell(nx, nz).index as usize;
                        for k in chf.cell_spans(nx, nz) {
                            let nspan = chf.spans[k];
                            let bot = span.y.max(nspan.y) as i32;
                            let top =
                                (span.y as i32 + span.h as i32).min(nspan.y as i32 + nspan.h as i32);
                            if top - bot >= walkable_height
                                && (nspan.y as i32 - span.y as i32).abs() <= walkable_climb
                            {
                                let layer = (k - ncell_start) as i32;
                                if layer > MAX_LAYERS {
                                    max_layer_index = max_layer_index.max(layer);
                                    continue;
                                }
                                span.set_con(dir, layer as u8);
                                break;
                            }
                        }
                    }
                    chf.spans[i] = span;
                }
            }
        }

        if max_layer_index > MAX_LAYERS {
            ctx.error(
                "compact",
                format!(
                    "column has too many layers: {} (max {})",
                    max_layer_index, MAX_LAYERS
                ),
            );
        }

        timer.finish(ctx);
        Ok(chf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::WALKABLE_AREA;

    fn solid_field(w: i32, h: i32) -> Heightfield {
        Heightfield::new(
            w,
            h,
            Vec3::ZERO,
            Vec3::new(w as f32, 20.0, h as f32),
            1.0,
            1.0,
        )
    }

    #[test]
    fn con_word_packs_four_slots() {
        let mut span = CompactSpan::default();
        for dir in 0..4 {
            span.set_con(dir, NOT_CONNECTED);
        }
        span.set_con(2, 5);
        assert_eq!(span.con(0), NOT_CONNECTED);
        assert_eq!(span.con(1), NOT_CONNECTED);
        assert_eq!(span.con(2), 5);
        assert_eq!(span.con(3), NOT_CONNECTED);
    }

    #[test]
    fn open_spans_sit_on_solid_tops() {
        let mut hf = solid_field(2, 1);
        let mut ctx = BuildContext::new();
        hf.add_span(0, 0, 0, 3, WALKABLE_AREA, 1).unwrap();
        hf.add_span(0, 0, 8, 10, WALKABLE_AREA, 1).unwrap();
        hf.add_span(1, 0, 0, 3, WALKABLE_AREA, 1).unwrap();
        let chf = CompactHeightfield::build_from_heightfield(&mut ctx, 2, 1, &hf).unwrap();
        assert_eq!(chf.span_count, 3);
        let c0: Vec<_> = chf.cell_spans(0, 0).map(|i| chf.spans[i]).collect();
        assert_eq!(c0[0].y, 3);
        assert_eq!(c0[0].h, 5); // up to the next solid's smin = 8
        assert_eq!(c0[1].y, 10);
        assert_eq!(c0[1].h, 0xff); // clamped open ceiling
    }

    #[test]
    fn cells_are_contiguous_and_ascending() {
        let mut hf = solid_field(3, 3);
        let mut ctx = BuildContext::new();
        for z in 0..3 {
            for x in 0..3 {
                hf.add_span(x, z, 0, 1, WALKABLE_AREA, 1).unwrap();
                hf.add_span(x, z, 5, 6, WALKABLE_AREA, 1).unwrap();
            }
        }
        let chf = CompactHeightfield::build_from_heightfield(&mut ctx, 2, 1, &hf).unwrap();
        let mut prev_end = 0u32;
        for z in 0..3 {
            for x in 0..3 {
                let cell = chf.cell(x, z);
                assert!(cell.index >= prev_end);
                prev_end = cell.index + cell.count as u32;
                let ys: Vec<_> = chf.cell_spans(x, z).map(|i| chf.spans[i].y).collect();
                assert!(ys.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }

    #[test]
    fn neighbor_links_are_reciprocal() {
        let mut hf = solid_field(3, 3);
        let mut ctx = BuildContext::new();
        for z in 0..3 {
            for x in 0..3 {
                hf.add_span(x, z, 0, 1, WALKABLE_AREA, 1).unwrap();
            }
        }
        let chf = CompactHeightfield::build_from_heightfield(&mut ctx, 2, 1, &hf).unwrap();
        for z in 0..3 {
            for x in 0..3 {
                for i in chf.cell_spans(x, z) {
                    let span = chf.spans[i];
                    for dir in 0..4 {
                        if let Some(n) = chf.neighbor_index(x, z, &span, dir) {
                            let nx = x + math::dir_offset_x(dir);
                            let nz = z + math::dir_offset_z(dir);
                            let back = chf
                                .neighbor_index(nx, nz, &chf.spans[n], (dir + 2) & 0x3)
                                .expect("reverse link missing");
                            assert_eq!(back, i);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn unclimbable_steps_are_not_linked() {
        let mut hf = solid_field(2, 1);
        let mut ctx = BuildContext::new();
        hf.add_span(0, 0, 0, 1, WALKABLE_AREA, 1).unwrap();
        hf.add_span(1, 0, 0, 6, WALKABLE_AREA, 1).unwrap();
        let chf = CompactHeightfield::build_from_heightfield(&mut ctx, 2, 2, &hf).unwrap();
        let left = chf.spans[chf.cell_spans(0, 0).next().unwrap()];
        assert_eq!(left.con(2), NOT_CONNECTED); // step of 5 > climb 2
    }
}
